//! JavaScript behind each [`PageScript`].
//!
//! Every script is wrapped as `(function (args) { PRELUDE BODY })(ARGS)` where
//! `ARGS` is the script serialized as JSON, and returns a JSON string.

use eoka_pilot_core::{PageScript, Result};

/// Visibility, query orders, pseudo-selector resolution and selector building
/// shared by all scripts. The query orders here are the ones `idx_N` and
/// `btn_idx_N` count over.
const PRELUDE: &str = r#"
    const isVisible = (el) => {
        if (!el) return false;
        const style = getComputedStyle(el);
        if (style.display === 'none' || style.visibility === 'hidden' || style.opacity === '0') return false;
        const rect = el.getBoundingClientRect();
        return rect.width > 0 && rect.height > 0;
    };

    const SKIPPED_TYPES = ['hidden', 'submit', 'button'];
    const inputOrder = () => Array.from(document.querySelectorAll('input, textarea, select'))
        .filter(el => !SKIPPED_TYPES.includes((el.getAttribute('type') || '').toLowerCase()))
        .filter(isVisible);

    const textOf = (el) => (el.innerText || el.value || el.title || el.getAttribute('aria-label') || '')
        .substring(0, 30).replace(/\n/g, ' ').trim();

    const actionableOrder = () => {
        const seen = new Set();
        const out = [];
        for (const sel of ['button:not([disabled])', 'input[type="submit"]', '[role="button"]', 'a[href]']) {
            document.querySelectorAll(sel).forEach(el => {
                if (seen.has(el) || !isVisible(el)) return;
                seen.add(el);
                if (textOf(el)) out.push(el);
            });
        }
        return out;
    };

    const resolve = (selector) => {
        let m = /^btn_idx_(\d+)$/.exec(selector);
        if (m) return actionableOrder()[Number(m[1])] || null;
        m = /^idx_(\d+)$/.exec(selector);
        if (m) return inputOrder()[Number(m[1])] || null;
        try {
            return document.querySelector(selector);
        } catch (e) {
            return null;
        }
    };

    const structural = (el) => {
        for (const attr of ['data-testid', 'data-test']) {
            const v = el.getAttribute(attr);
            if (v) return '[' + attr + '=' + JSON.stringify(v) + ']';
        }
        if (el.id) return '#' + CSS.escape(el.id);
        const name = el.getAttribute('name');
        if (name) return '[name=' + JSON.stringify(name) + ']';
        const aria = el.getAttribute('aria-label');
        if (aria) return '[aria-label=' + JSON.stringify(aria) + ']';
        let sel = el.tagName.toLowerCase();
        if (typeof el.className === 'string') {
            const classes = el.className.split(/\s+/).filter(c => c && !c.includes(':'));
            if (classes.length > 0) sel += '.' + classes.slice(0, 2).map(c => CSS.escape(c)).join('.');
        }
        return sel;
    };

    // Structural selector when it is unique, otherwise the pseudo-selector.
    const selectorFor = (el, pseudo) => {
        const sel = structural(el);
        try {
            if (document.querySelectorAll(sel).length === 1) return sel;
        } catch (e) {}
        return pseudo;
    };

    const labelOf = (el) => {
        let text = '';
        if (el.id) {
            const label = document.querySelector('label[for=' + JSON.stringify(el.id) + ']');
            if (label) text = label.innerText;
        }
        if (!text && el.closest('label')) text = el.closest('label').innerText;
        if (!text && el.previousElementSibling) text = el.previousElementSibling.innerText || '';
        return (text || '').trim().substring(0, 30);
    };

    const done = (success, error, isLink) =>
        JSON.stringify({ success, error: error || null, is_link: !!isLink });

    const interactable = (el, selector) => {
        if (!el) return 'element not found: ' + selector;
        if (!isVisible(el)) return 'element is hidden';
        if (el.disabled) return 'element is disabled';
        return null;
    };
"#;

const OBSERVE: &str = r#"
    const inputs = inputOrder().slice(0, 30).map((el, i) => {
        const tag = el.tagName.toLowerCase();
        const type = tag === 'input' ? (el.getAttribute('type') || 'text').toLowerCase() : tag;
        return {
            key: el.getAttribute('name') || el.id || 'idx_' + i,
            input_type: type,
            placeholder: el.getAttribute('placeholder') || '',
            label: labelOf(el),
            selector: selectorFor(el, 'idx_' + i),
            disabled: !!el.disabled,
            value: type === 'password' ? '' : String(el.value || '').substring(0, 20),
        };
    });
    const actionables = actionableOrder().slice(0, 50).map((el, i) => ({
        key: 'btn_idx_' + i,
        text: textOf(el),
        tag: el.tagName.toLowerCase(),
        input_type: el.getAttribute('type') || el.getAttribute('role') || null,
        selector: selectorFor(el, 'btn_idx_' + i),
    }));
    return JSON.stringify({
        url: location.href,
        title: document.title,
        text: (document.body ? document.body.innerText : '').substring(0, 2500),
        inputs,
        actionables,
    });
"#;

const FILL: &str = r#"
    const el = resolve(args.selector);
    const problem = interactable(el, args.selector);
    if (problem) return done(false, problem);
    el.focus();
    if (el.isContentEditable) {
        el.textContent = args.value;
    } else if ('value' in el) {
        // Native setter so framework-controlled inputs see the change.
        const proto = el instanceof HTMLTextAreaElement ? HTMLTextAreaElement.prototype
            : el instanceof HTMLSelectElement ? HTMLSelectElement.prototype
            : HTMLInputElement.prototype;
        const desc = Object.getOwnPropertyDescriptor(proto, 'value');
        if (desc && desc.set) desc.set.call(el, args.value); else el.value = args.value;
    } else {
        return done(false, 'element is not fillable');
    }
    for (const type of ['focus', 'input', 'change']) {
        el.dispatchEvent(new Event(type, { bubbles: true }));
    }
    return done(true);
"#;

const CLICK: &str = r#"
    const el = resolve(args.selector);
    const problem = interactable(el, args.selector);
    if (problem) return done(false, problem);
    const rect = el.getBoundingClientRect();
    if (rect.top < 0 || rect.bottom > window.innerHeight) {
        el.scrollIntoView({ block: 'center' });
    }
    for (const type of ['mouseenter', 'mouseover', 'mousedown', 'mouseup']) {
        el.dispatchEvent(new MouseEvent(type, { bubbles: true }));
    }
    const isLink = el.tagName === 'A' && !!el.getAttribute('href');
    el.click();
    return done(true, null, isLink);
"#;

const HOVER: &str = r#"
    const el = resolve(args.selector);
    const problem = interactable(el, args.selector);
    if (problem) return done(false, problem);
    for (const type of ['pointerover', 'mouseenter', 'mouseover']) {
        el.dispatchEvent(new MouseEvent(type, { bubbles: true }));
    }
    return done(true);
"#;

const SELECT: &str = r#"
    const el = resolve(args.selector);
    const problem = interactable(el, args.selector);
    if (problem) return done(false, problem);
    if (el.tagName !== 'SELECT') return done(false, 'element is not a select');
    const wanted = String(args.value).trim();
    const option = Array.from(el.options).find(o => o.value === wanted || o.text.trim() === wanted);
    if (!option) return done(false, "no option '" + wanted + "'");
    el.value = option.value;
    el.dispatchEvent(new Event('input', { bubbles: true }));
    el.dispatchEvent(new Event('change', { bubbles: true }));
    return done(true);
"#;

const SCROLL: &str = r#"
    if (args.direction === 'to') {
        const el = args.selector ? resolve(args.selector) : null;
        if (!el) return done(false, 'element not found: ' + args.selector);
        el.scrollIntoView({ block: 'center' });
        return done(true);
    }
    window.scrollBy(0, args.direction === 'up' ? -args.amount : args.amount);
    return done(true);
"#;

const INSPECT: &str = r#"
    const el = resolve(args.selector);
    return JSON.stringify({ exists: !!el, visible: isVisible(el) });
"#;

/// URL and `document.readyState` of the page.
pub(crate) const READY_STATE: &str = r#"
(function () {
    return JSON.stringify({ url: location.href, readyState: document.readyState });
})()
"#;

fn body(script: &PageScript) -> &'static str {
    match script {
        PageScript::Observe => OBSERVE,
        PageScript::Fill { .. } => FILL,
        PageScript::Click { .. } => CLICK,
        PageScript::Hover { .. } => HOVER,
        PageScript::Select { .. } => SELECT,
        PageScript::Scroll { .. } => SCROLL,
        PageScript::Inspect { .. } => INSPECT,
    }
}

/// Self-contained JavaScript expression for `script`.
pub(crate) fn render(script: &PageScript) -> Result<String> {
    let args = serde_json::to_string(script)?;
    let mut js = String::from("(function (args) {\n");
    js.push_str(PRELUDE);
    js.push_str(body(script));
    js.push_str("\n})(");
    js.push_str(&args);
    js.push(')');
    Ok(js)
}
