//! Readable automation code for recorded steps. The output is for review
//! only and is never executed.

use serde_json::Value;

use crate::models::{Step, StepKind};

fn quoted(text: &str) -> String {
    Value::String(text.to_string()).to_string()
}

fn num(value: Option<f64>) -> String {
    let n = value.unwrap_or(0.0);
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        format!("{:.1}", n)
    }
}

fn key_name(step: &Step) -> &str {
    if !step.value.is_empty() {
        return &step.value;
    }
    step.options
        .extra
        .get("key")
        .and_then(Value::as_str)
        .unwrap_or("")
}

/// Code for a single step
pub fn step_code(step: &Step) -> String {
    let sel = quoted(&step.selector);
    let c = &step.coordinates;

    match step.kind {
        StepKind::Click => format!("await page.click({});", sel),
        StepKind::Input => format!("await page.type({}, {});", sel, quoted(&step.value)),
        StepKind::Change => {
            if step.options.tag_name.as_deref() == Some("select")
                || step.options.extra.get("type").and_then(Value::as_str) == Some("select-one")
            {
                format!("await page.select({}, {});", sel, quoted(&step.value))
            } else {
                format!(
                    "await page.$eval({}, (el, v) => {{ el.value = v; }}, {});",
                    sel,
                    quoted(&step.value)
                )
            }
        }
        StepKind::Keydown => {
            let key = key_name(step);
            if step.selector.is_empty() {
                format!("await page.keyboard.press({});", quoted(key))
            } else {
                format!("await page.focus({});\nawait page.keyboard.press({});", sel, quoted(key))
            }
        }
        StepKind::Scroll => {
            if step.options.is_window.unwrap_or(step.selector.is_empty()) {
                format!(
                    "await page.evaluate(() => window.scrollTo({}, {}));",
                    num(c.scroll_x),
                    num(c.scroll_y)
                )
            } else {
                format!(
                    "await page.$eval({}, el => {{ el.scrollTop = {}; }});",
                    sel,
                    num(c.scroll_y)
                )
            }
        }
        StepKind::Swipe | StepKind::MouseDrag if c.swipe_span().is_some() => format!(
            "// {} {}\nawait page.mouse.move({}, {});\nawait page.mouse.down();\nawait page.mouse.move({}, {}, {{ steps: 10 }});\nawait page.mouse.up();",
            step.kind,
            if step.value.is_empty() { "gesture" } else { step.value.as_str() },
            num(c.start_x),
            num(c.start_y),
            num(c.end_x),
            num(c.end_y)
        ),
        StepKind::Swipe => {
            let distance = c.distance.unwrap_or(50.0);
            let dy = if step.value == "up" { -distance } else { distance };
            format!("await page.mouse.wheel({{ deltaY: {} }});", num(Some(dy)))
        }
        StepKind::MouseDrag => format!("await page.mouse.move({}, {});", num(c.x), num(c.y)),
        StepKind::TouchStart => format!(
            "// touch start at ({}, {})\nawait page.touchscreen.tap({}, {});",
            num(c.x),
            num(c.y),
            num(c.x),
            num(c.y)
        ),
        StepKind::TouchMove => format!("// touch move to ({}, {})", num(c.x), num(c.y)),
        StepKind::TouchEnd => format!("// touch end at ({}, {})", num(c.x), num(c.y)),
        StepKind::Submit => format!("await page.$eval({}, form => form.submit());", sel),
        StepKind::Navigate | StepKind::HashChange | StepKind::CrossDomainNavigation => {
            format!("await page.goto({});", quoted(&step.value))
        }
        StepKind::Back | StepKind::PopState => "await page.goBack();".to_string(),
        StepKind::BeforeUnload => "// page unloads".to_string(),
        StepKind::Unknown => format!("// {}: {}", step.kind, step.selector),
    }
}

/// Whole-session script listing
pub fn session_script(target_url: &str, steps: &[Step]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "// Recorded session: {} steps\nawait page.goto({});\n",
        steps.len(),
        quoted(target_url)
    ));
    for (i, step) in steps.iter().enumerate() {
        out.push_str(&format!("\n// Step {}: {}\n", i + 1, step.kind));
        out.push_str(&step_code(step));
        out.push('\n');
    }
    out
}
