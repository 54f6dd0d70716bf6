use std::collections::BTreeMap;

use rand::distributions::Alphanumeric;
use rand::Rng as _;

use crate::event::Event;
use crate::repository::BindingParam;

/// Replace `{{ key }}` placeholders in raw manifest bytes BEFORE YAML
/// parsing, so values can land in structural positions (spec §4.4).
/// Template substitution is a pure function of
/// `(manifest_bytes, event, binding.params)`: identical inputs yield
/// byte-identical outputs.
pub fn render(manifest: &[u8], event: &Event, params: &[BindingParam]) -> (Vec<u8>, Vec<String>) {
    let text = String::from_utf8_lossy(manifest);
    let values = builtin_values(event, params);
    let mut unresolved = Vec::new();

    let rendered = substitute(&text, &values, &mut unresolved);
    (rendered.into_bytes(), unresolved)
}

fn builtin_values(event: &Event, params: &[BindingParam]) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    values.insert("repo_url".to_owned(), event.base_url.clone());
    values.insert("repo_owner".to_owned(), event.organization.clone());
    values.insert("repo_name".to_owned(), event.repository.clone());
    values.insert("revision".to_owned(), event.sha.clone());
    values.insert("source_branch".to_owned(), event.head_branch.clone());
    values.insert("target_branch".to_owned(), event.base_branch.clone());
    values.insert("sender".to_owned(), event.sender.clone());
    values.insert(
        "event_type".to_owned(),
        event.event_kind.map(|k| k.to_string()).unwrap_or_default(),
    );
    values.insert(
        "pull_request_number".to_owned(),
        event
            .pull_request_number
            .map(|n| n.to_string())
            .unwrap_or_default(),
    );
    for param in params {
        values.insert(param.name.clone(), param.value.clone());
    }
    values
}

/// Single pass over the rendered text; placeholders with unknown keys are
/// left untouched and collected for a warning comment.
fn substitute(text: &str, values: &BTreeMap<String, String>, unresolved: &mut Vec<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let key = after[..end].trim();
        match values.get(key) {
            Some(value) => out.push_str(value),
            None => {
                unresolved.push(key.to_owned());
                out.push_str(&rest[start..start + 4 + end]);
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

pub fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

pub fn pac_labels(repository: &str, sha: &str, event_type: &str, branch: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "pipelinesascode.tekton.dev/repository".to_owned(),
        repository.to_owned(),
    );
    labels.insert("pipelinesascode.tekton.dev/sha".to_owned(), sha.to_owned());
    labels.insert(
        "pipelinesascode.tekton.dev/event-type".to_owned(),
        event_type.to_owned(),
    );
    labels.insert("pipelinesascode.tekton.dev/branch".to_owned(), branch.to_owned());
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn event() -> Event {
        Event {
            base_url: "https://github.com/owner/repo".to_owned(),
            organization: "owner".to_owned(),
            repository: "repo".to_owned(),
            sha: "deadbeef".to_owned(),
            head_branch: "feature".to_owned(),
            base_branch: "main".to_owned(),
            sender: "alice".to_owned(),
            pull_request_number: Some(7),
            ..Default::default()
        }
    }

    #[test]
    fn substitutes_builtin_keys() {
        let manifest = b"revision: {{ revision }}\nbranch: {{ target_branch }}\n";
        let (rendered, unresolved) = render(manifest, &event(), &[]);
        assert_eq!(
            String::from_utf8(rendered).unwrap(),
            "revision: deadbeef\nbranch: main\n"
        );
        assert!(unresolved.is_empty());
    }

    #[test]
    fn leaves_unknown_keys_untouched_and_reports_them() {
        let manifest = b"value: {{ nonexistent }}\n";
        let (rendered, unresolved) = render(manifest, &event(), &[]);
        assert_eq!(String::from_utf8(rendered).unwrap(), "value: {{ nonexistent }}\n");
        assert_eq!(unresolved, vec!["nonexistent".to_owned()]);
    }

    #[test]
    fn is_pure_given_identical_inputs() {
        let manifest = b"x: {{ sender }}\n";
        let (a, _) = render(manifest, &event(), &[]);
        let (b, _) = render(manifest, &event(), &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn binding_params_override_via_insertion() {
        let params = vec![BindingParam {
            name: "custom".to_owned(),
            value: "42".to_owned(),
            secret_ref: None,
        }];
        let manifest = b"x: {{ custom }}\n";
        let (rendered, _) = render(manifest, &event(), &params);
        assert_eq!(String::from_utf8(rendered).unwrap(), "x: 42\n");
    }
}
