use std::cell::RefCell;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use cel_interpreter::extractors::This;
use cel_interpreter::{Context, Program, Value};
use globset::Glob;

use crate::event::Event;

/// Evaluates an `on-cel-expression` annotation with the fixed environment
/// from spec §4.4/§9: `event`, `headers`, `body`, `files`, `target_branch`,
/// `source_branch`, `event_type`, and a `"glob".pathChanged()` receiver
/// method (the glob is the CEL method receiver, not a positional argument,
/// matching `.pathChanged(glob)` binding syntax). No stateful builtins are
/// registered.
pub struct CelEvaluator<'files> {
    changed_files: RefCell<Option<&'files [String]>>,
}

impl<'files> CelEvaluator<'files> {
    pub fn new(changed_files: &'files [String]) -> Self {
        Self {
            changed_files: RefCell::new(Some(changed_files)),
        }
    }

    pub fn evaluate(&self, expression: &str, event: &Event, headers_json: &str, body: &str) -> Result<bool> {
        let program = Program::compile(expression)
            .with_context(|| format!("failed to compile CEL expression: {expression}"))?;
        let mut context = Context::default();

        context
            .add_variable("event", event.event_kind.map(|k| k.to_string()).unwrap_or_default())
            .with_context(|| "failed to bind `event`")?;
        context
            .add_variable("event_type", event.event_kind.map(|k| k.to_string()).unwrap_or_default())
            .with_context(|| "failed to bind `event_type`")?;
        context
            .add_variable("target_branch", event.base_branch.clone())
            .with_context(|| "failed to bind `target_branch`")?;
        context
            .add_variable("source_branch", event.head_branch.clone())
            .with_context(|| "failed to bind `source_branch`")?;
        context
            .add_variable("headers", headers_json.to_owned())
            .with_context(|| "failed to bind `headers`")?;
        context
            .add_variable("body", body.to_owned())
            .with_context(|| "failed to bind `body`")?;

        let files = self.changed_files.borrow();
        let files_list: Vec<Value> = files
            .map(|f| f.iter().map(|s| Value::String(s.clone().into())).collect())
            .unwrap_or_default();
        context
            .add_variable("files", files_list.clone())
            .with_context(|| "failed to bind `files`")?;

        context
            .add_function("pathChanged", move |This(glob_pattern): This<Arc<String>>| -> bool {
                let Ok(glob) = Glob::new(glob_pattern.as_str()) else {
                    return false;
                };
                let matcher = glob.compile_matcher();
                files_list.iter().any(|f| match f {
                    Value::String(s) => matcher.is_match(s.as_str()),
                    _ => false,
                })
            });

        let result = program
            .execute(&context)
            .with_context(|| format!("failed to evaluate CEL expression: {expression}"))?;
        Ok(matches!(result, Value::Bool(true)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> Event {
        Event {
            event_kind: Some(crate::event::EventKind::Push),
            ..Default::default()
        }
    }

    #[test]
    fn path_changed_matches_glob() {
        let files = vec!["src/main.rs".to_owned()];
        let evaluator = CelEvaluator::new(&files);
        let result = evaluator
            .evaluate(r#""src/**".pathChanged()"#, &event(), "{}", "{}")
            .unwrap();
        assert!(result);
    }

    #[test]
    fn path_changed_rejects_non_matching_glob() {
        let files = vec!["docs/x.md".to_owned()];
        let evaluator = CelEvaluator::new(&files);
        let result = evaluator
            .evaluate(r#"event_type == "push" && "**/*.go".pathChanged()"#, &event(), "{}", "{}")
            .unwrap();
        assert!(!result);
    }

    #[test]
    fn seed_scenario_path_changed_literal_matches() {
        let files = vec!["main.go".to_owned()];
        let evaluator = CelEvaluator::new(&files);
        let result = evaluator
            .evaluate(r#"event == "push" && "**/*.go".pathChanged()"#, &event(), "{}", "{}")
            .unwrap();
        assert!(result);
    }
}
