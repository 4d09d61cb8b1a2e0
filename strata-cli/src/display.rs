//! Terminal output for plans and run results

use std::collections::HashMap;

use colored::{ColoredString, Colorize};

use strata_core::effect::{Action, Effect};
use strata_core::executor::{NodeStatus, OperationOutcome, RunReport, RunState};
use strata_core::plan::Plan;
use strata_core::resource::Value;

fn colored_symbol(action: Action) -> ColoredString {
    match action {
        Action::Create => action.symbol().green().bold(),
        Action::Update => action.symbol().yellow().bold(),
        Action::Replace => action.symbol().magenta().bold(),
        Action::Delete => action.symbol().red().bold(),
    }
}

pub fn print_plan(plan: &Plan) {
    if plan.is_empty() {
        println!("{}", "No changes. Infrastructure is up-to-date.".green());
        return;
    }

    println!("{}", "Execution Plan:".cyan().bold());
    println!();

    for effect in plan.effects() {
        println!("  {} {}", colored_symbol(effect.action()), effect.id());
        match effect {
            Effect::Create(resource) => print_attributes(&resource.attributes),
            Effect::Update {
                from,
                to,
                changed_attributes,
            }
            | Effect::Replace {
                from,
                to,
                changed_attributes,
            } => {
                for key in changed_attributes {
                    let old = from
                        .attributes
                        .get(key)
                        .map(format_value)
                        .unwrap_or_else(|| "(none)".to_string());
                    let new = to.attributes.get(key).map(format_value).unwrap_or_default();
                    println!("      {}: {} → {}", key, old.red(), new.green());
                }
                if matches!(effect, Effect::Replace { .. }) {
                    println!("      {}", "(forces replacement)".magenta());
                }
            }
            Effect::Delete(record) => {
                println!("      {}", format!("id: {}", record.identifier).dimmed());
            }
        }
    }

    println!();
    println!("{}", plan.summary().to_string().bold());
}

fn print_attributes(attributes: &HashMap<String, Value>) {
    let mut keys: Vec<&String> = attributes.keys().collect();
    keys.sort();
    for key in keys {
        println!("      {}: {}", key, format_value(&attributes[key]));
    }
}

/// Render a value; references print as `${kind.name.attr}` until known
pub fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", s),
        Value::ResourceRef(r) => format!("${{{}}}", r),
        Value::List(items) => {
            let strs: Vec<_> = items.iter().map(format_value).collect();
            format!("[{}]", strs.join(", "))
        }
        Value::Map(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let strs: Vec<_> = keys
                .into_iter()
                .map(|k| format!("{}: {}", k, format_value(&map[k])))
                .collect();
            format!("{{{}}}", strs.join(", "))
        }
        other => other.to_string(),
    }
}

/// One line per finished operation, printed as results arrive
pub fn print_outcome(effect: &Effect, outcome: &OperationOutcome) {
    match outcome.status {
        NodeStatus::Done => {
            let retries = if outcome.attempts > 1 {
                format!(" (after {} attempts)", outcome.attempts)
            } else {
                String::new()
            };
            println!("  {} {}{}", "✓".green(), effect, retries.dimmed());
        }
        NodeStatus::Failed => println!(
            "  {} {} - {}",
            "✗".red(),
            effect,
            outcome.error.as_deref().unwrap_or("failed")
        ),
        NodeStatus::Skipped => println!(
            "  {} {} - {}",
            "○".yellow(),
            effect,
            outcome.error.as_deref().unwrap_or("skipped")
        ),
        NodeStatus::Cancelled => println!("  {} {} - cancelled", "○".dimmed(), effect),
        NodeStatus::Planned | NodeStatus::InProgress => {}
    }
}

pub fn print_report(report: &RunReport, verb: &str) {
    println!();
    match report.state {
        RunState::Completed => println!(
            "{}",
            format!("{} complete! {} changes applied.", verb, report.done().len())
                .green()
                .bold()
        ),
        RunState::CompletedWithErrors => println!(
            "{}",
            format!(
                "{} finished with errors. {} succeeded, {} failed, {} skipped.",
                verb,
                report.done().len(),
                report.failed().len(),
                report.skipped().len()
            )
            .red()
            .bold()
        ),
        RunState::Aborted => {
            println!(
                "{}",
                format!(
                    "{} aborted. {} succeeded, {} not started.",
                    verb,
                    report.done().len(),
                    report.cancelled().len()
                )
                .red()
                .bold()
            );
            if let Some(reason) = &report.abort_reason {
                println!("  {}", reason.red());
            }
        }
        RunState::Idle | RunState::Running => {}
    }
}
