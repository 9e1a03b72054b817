//! Per-domain memory: which selectors worked for which semantic element, and
//! which step sequences accomplished which goals.
//!
//! Each domain lives under its own store key (`memory:<domain>`). Every
//! mutation re-reads the stored record first, so writers never clobber each
//! other with stale copies.

use crate::clock::Clock;
use crate::config::MemorySettings;
use crate::state::PlannedStep;
use crate::store::KvStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

const KEY_PREFIX: &str = "memory:";
const EXPORT_VERSION: u32 = 1;
const DAY_MS: i64 = 24 * 60 * 60 * 1000;
const MAX_CONFIDENCE: f64 = 0.99;

/// Remembered selector for one semantic element on a domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorPattern {
    pub selector: String,
    /// Previously used selectors, most recent first.
    #[serde(default)]
    pub fallbacks: Vec<String>,
    pub success_count: u32,
    pub fail_count: u32,
    pub confidence: f64,
    pub last_success: Option<i64>,
    pub last_used: i64,
}

/// Step list cached for a normalized intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub steps: Vec<PlannedStep>,
    pub success_count: u32,
    pub fail_count: u32,
    pub last_used: i64,
    pub created_at: i64,
}

/// Everything remembered about one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainMemory {
    #[serde(default)]
    pub selectors: BTreeMap<String, SelectorPattern>,
    #[serde(default)]
    pub templates: BTreeMap<String, TaskTemplate>,
    pub created_at: i64,
    pub last_accessed: i64,
}

impl DomainMemory {
    pub(crate) fn new(now: i64) -> Self {
        Self {
            selectors: BTreeMap::new(),
            templates: BTreeMap::new(),
            created_at: now,
            last_accessed: now,
        }
    }

    /// Patterns above `min_confidence`, best first, at most `limit`.
    pub fn hints(&self, min_confidence: f64, limit: usize) -> Vec<(&str, &SelectorPattern)> {
        let mut hints: Vec<_> = self
            .selectors
            .iter()
            .filter(|(_, p)| p.confidence > min_confidence)
            .map(|(name, p)| (name.as_str(), p))
            .collect();
        hints.sort_by(|a, b| {
            b.1.confidence
                .partial_cmp(&a.1.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        hints.truncate(limit);
        hints
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainStats {
    pub domain: String,
    pub selectors: usize,
    pub templates: usize,
    pub last_accessed: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_domains: usize,
    pub total_selectors: usize,
    pub total_templates: usize,
    /// Most recently accessed first.
    pub domains: Vec<DomainStats>,
}

/// Portable dump of every domain's memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryExport {
    pub version: u32,
    pub exported_at: i64,
    pub domains: BTreeMap<String, DomainMemory>,
}

/// Host part of a URL, or `unknown` when there is none.
pub fn domain_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Lowercase, drop punctuation, collapse whitespace.
pub fn normalize_intent(intent: &str) -> String {
    let cleaned: String = intent
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Confidence-scored selector and template memory.
pub struct MemoryStore {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    settings: MemorySettings,
    write_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, settings: MemorySettings) -> Self {
        Self {
            kv,
            clock,
            settings,
            write_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &MemorySettings {
        &self.settings
    }

    fn key(domain: &str) -> String {
        format!("{}{}", KEY_PREFIX, domain)
    }

    async fn load(&self, domain: &str) -> Result<Option<DomainMemory>> {
        match self.kv.get(&Self::key(domain)).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| Error::Store(format!("corrupt memory for {}: {}", domain, e))),
            None => Ok(None),
        }
    }

    async fn save(&self, domain: &str, memory: &DomainMemory) -> Result<()> {
        self.kv
            .set(&Self::key(domain), serde_json::to_value(memory)?)
            .await
    }

    /// Memory for a domain. Refreshes `last_accessed` on an existing record;
    /// selectors and templates are returned untouched.
    pub async fn get_domain_memory(&self, domain: &str) -> Result<DomainMemory> {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now_ms();
        match self.load(domain).await? {
            Some(mut memory) => {
                memory.last_accessed = now;
                self.save(domain, &memory).await?;
                Ok(memory)
            }
            None => Ok(DomainMemory::new(now)),
        }
    }

    /// Record the outcome of using `selector` for the element called `name`.
    pub async fn save_selector(
        &self,
        url: &str,
        name: &str,
        selector: &str,
        success: bool,
    ) -> Result<()> {
        let domain = domain_of(url);
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now_ms();
        let mut memory = self
            .load(&domain)
            .await?
            .unwrap_or_else(|| DomainMemory::new(now));

        match memory.selectors.get_mut(name) {
            None => {
                memory.selectors.insert(
                    name.to_string(),
                    SelectorPattern {
                        selector: selector.to_string(),
                        fallbacks: Vec::new(),
                        success_count: u32::from(success),
                        fail_count: u32::from(!success),
                        confidence: if success { 0.6 } else { 0.3 },
                        last_success: success.then_some(now),
                        last_used: now,
                    },
                );
            }
            Some(pattern) => {
                if success {
                    pattern.success_count += 1;
                    pattern.last_success = Some(now);
                    if selector != pattern.selector {
                        let previous = std::mem::replace(&mut pattern.selector, selector.to_string());
                        pattern.fallbacks.retain(|f| f != selector && f != &previous);
                        pattern.fallbacks.insert(0, previous);
                        pattern.fallbacks.truncate(self.settings.max_fallbacks);
                        debug!("memory: promoted '{}' for {} on {}", selector, name, domain);
                    }
                } else {
                    pattern.fail_count += 1;
                    if selector == pattern.selector && !pattern.fallbacks.is_empty() {
                        let promoted = pattern.fallbacks.remove(0);
                        let failed = std::mem::replace(&mut pattern.selector, promoted);
                        pattern.fallbacks.insert(0, failed);
                        pattern.fallbacks.truncate(self.settings.max_fallbacks);
                        debug!(
                            "memory: rotated to '{}' for {} on {}",
                            pattern.selector, name, domain
                        );
                    }
                }
                let total = f64::from(pattern.success_count + pattern.fail_count);
                pattern.confidence = (f64::from(pattern.success_count) / total).min(MAX_CONFIDENCE);
                pattern.last_used = now;
            }
        }

        evict_lru(&mut memory.selectors, self.settings.max_selectors, |p| p.last_used);
        memory.last_accessed = now;
        self.save(&domain, &memory).await
    }

    /// Stored selector for `name`, without touching any timestamps.
    pub async fn get_selector(&self, url: &str, name: &str) -> Result<Option<SelectorPattern>> {
        let domain = domain_of(url);
        Ok(self
            .load(&domain)
            .await?
            .and_then(|m| m.selectors.get(name).cloned()))
    }

    /// Cache `steps` as the way to accomplish `intent` on this URL's domain.
    pub async fn save_task_template(
        &self,
        url: &str,
        intent: &str,
        steps: Vec<PlannedStep>,
    ) -> Result<()> {
        let key = normalize_intent(intent);
        if key.is_empty() || steps.is_empty() {
            return Ok(());
        }
        let domain = domain_of(url);
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now_ms();
        let mut memory = self
            .load(&domain)
            .await?
            .unwrap_or_else(|| DomainMemory::new(now));

        memory.templates.insert(
            key,
            TaskTemplate {
                steps,
                success_count: 1,
                fail_count: 0,
                last_used: now,
                created_at: now,
            },
        );
        evict_lru(&mut memory.templates, self.settings.max_templates, |t| {
            t.last_used
        });
        memory.last_accessed = now;
        info!("memory: saved template for '{}' on {}", intent, domain);
        self.save(&domain, &memory).await
    }

    /// Template for `intent`: exact normalized match first, then the first
    /// stored intent sharing at least `min(2, keywords)` words.
    pub async fn get_task_template(&self, url: &str, intent: &str) -> Result<Option<TaskTemplate>> {
        let wanted = normalize_intent(intent);
        if wanted.is_empty() {
            return Ok(None);
        }
        let domain = domain_of(url);
        let _guard = self.write_lock.lock().await;
        let Some(mut memory) = self.load(&domain).await? else {
            return Ok(None);
        };

        let hit = if memory.templates.contains_key(&wanted) {
            Some(wanted.clone())
        } else {
            let keywords: Vec<&str> = wanted.split(' ').collect();
            let needed = keywords.len().min(2);
            memory
                .templates
                .keys()
                .find(|stored| {
                    let stored: Vec<&str> = stored.split(' ').collect();
                    keywords.iter().filter(|k| stored.contains(k)).count() >= needed
                })
                .cloned()
        };

        let Some(key) = hit else {
            return Ok(None);
        };
        let now = self.clock.now_ms();
        let template = memory.templates.get_mut(&key).map(|t| {
            t.last_used = now;
            t.clone()
        });
        memory.last_accessed = now;
        self.save(&domain, &memory).await?;
        Ok(template)
    }

    /// Count a replay of the template stored for `intent`.
    pub async fn record_template_outcome(&self, url: &str, intent: &str, success: bool) -> Result<()> {
        let key = normalize_intent(intent);
        let domain = domain_of(url);
        let _guard = self.write_lock.lock().await;
        let Some(mut memory) = self.load(&domain).await? else {
            return Ok(());
        };
        let Some(template) = memory.templates.get_mut(&key) else {
            return Ok(());
        };
        if success {
            template.success_count += 1;
        } else {
            template.fail_count += 1;
        }
        template.last_used = self.clock.now_ms();
        self.save(&domain, &memory).await
    }

    /// Drop domains not accessed within the configured age. Returns how many
    /// were removed.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now_ms();
        let max_age = self.settings.max_age_days * DAY_MS;
        let mut removed = 0;
        for key in self.kv.keys(KEY_PREFIX).await? {
            let domain = &key[KEY_PREFIX.len()..];
            let expired = match self.load(domain).await {
                Ok(Some(memory)) => now - memory.last_accessed > max_age,
                Ok(None) => false,
                Err(_) => true,
            };
            if expired {
                self.kv.remove(&key).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("memory: expired {} domain(s)", removed);
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<MemoryStats> {
        let domains = self.export().await?.domains;
        let mut stats = MemoryStats {
            total_domains: domains.len(),
            total_selectors: 0,
            total_templates: 0,
            domains: Vec::with_capacity(domains.len()),
        };
        for (domain, memory) in domains {
            stats.total_selectors += memory.selectors.len();
            stats.total_templates += memory.templates.len();
            stats.domains.push(DomainStats {
                domain,
                selectors: memory.selectors.len(),
                templates: memory.templates.len(),
                last_accessed: memory.last_accessed,
            });
        }
        stats
            .domains
            .sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
        Ok(stats)
    }

    pub async fn export(&self) -> Result<MemoryExport> {
        let mut domains = BTreeMap::new();
        for key in self.kv.keys(KEY_PREFIX).await? {
            let domain = key[KEY_PREFIX.len()..].to_string();
            if let Some(memory) = self.load(&domain).await? {
                domains.insert(domain, memory);
            }
        }
        Ok(MemoryExport {
            version: EXPORT_VERSION,
            exported_at: self.clock.now_ms(),
            domains,
        })
    }

    /// Import an export. With `merge`, incoming entries overwrite same-named
    /// ones and everything else is kept; without it, existing memory is
    /// replaced wholesale.
    pub async fn import(&self, data: MemoryExport, merge: bool) -> Result<()> {
        if !merge {
            self.clear_all().await?;
        }
        let _guard = self.write_lock.lock().await;
        for (domain, incoming) in data.domains {
            let memory = match (merge, self.load(&domain).await?) {
                (true, Some(mut existing)) => {
                    existing.selectors.extend(incoming.selectors);
                    existing.templates.extend(incoming.templates);
                    existing.last_accessed = existing.last_accessed.max(incoming.last_accessed);
                    evict_lru(&mut existing.selectors, self.settings.max_selectors, |p| {
                        p.last_used
                    });
                    evict_lru(&mut existing.templates, self.settings.max_templates, |t| {
                        t.last_used
                    });
                    existing
                }
                _ => incoming,
            };
            self.save(&domain, &memory).await?;
        }
        Ok(())
    }

    pub async fn clear_domain(&self, domain: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.kv.remove(&Self::key(domain)).await
    }

    pub async fn clear_all(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        for key in self.kv.keys(KEY_PREFIX).await? {
            self.kv.remove(&key).await?;
        }
        Ok(())
    }
}

/// Remove least-recently-used entries until `map` holds at most `cap`.
fn evict_lru<T>(map: &mut BTreeMap<String, T>, cap: usize, last_used: impl Fn(&T) -> i64) {
    if map.len() <= cap {
        return;
    }
    let mut by_age: Vec<(i64, String)> = map
        .iter()
        .map(|(k, v)| (last_used(v), k.clone()))
        .collect();
    by_age.sort();
    let excess = map.len() - cap;
    for (_, key) in by_age.into_iter().take(excess) {
        map.remove(&key);
    }
}
