//! `weft validate`: parse and validate a workflow file.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::json;
use weft_core::workflow::definition::load_workflow_file;
use weft_types::definition::WorkflowDefinition;

pub fn validate_file(file: &Path, json: bool) -> Result<()> {
    let definition = load_workflow_file(file)
        .with_context(|| format!("{} is not a valid workflow", file.display()))?;
    println!("{}", summarize(&definition, json)?);
    Ok(())
}

fn summarize(definition: &WorkflowDefinition, json: bool) -> Result<String> {
    let document = &definition.document;
    if json {
        let summary = json!({
            "valid": true,
            "namespace": document.namespace,
            "name": document.name,
            "version": document.version,
            "tasks": definition.do_.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            "extensions": definition.extensions().map(|(name, _)| name).collect::<Vec<_>>(),
        });
        return Ok(serde_json::to_string_pretty(&summary)?);
    }
    Ok(format!(
        "{} is valid ({} top-level tasks)",
        definition.qualified_name(),
        definition.do_.len()
    ))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const FLOW: &str = r#"
document: { namespace: default, name: shipping, version: 2.0.0 }
do:
  - pack:
      set: { packed: true }
  - ship:
      call: echo
"#;

    #[test]
    fn test_validate_summary() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FLOW.as_bytes()).unwrap();
        let definition = load_workflow_file(file.path()).unwrap();

        assert_eq!(
            summarize(&definition, false).unwrap(),
            "shipping.default:2.0.0 is valid (2 top-level tasks)"
        );
        let summary: serde_json::Value =
            serde_json::from_str(&summarize(&definition, true).unwrap()).unwrap();
        assert_eq!(summary["tasks"], json!(["pack", "ship"]));
        assert_eq!(summary["version"], "2.0.0");
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"document: { name: '' }\ndo: []\n").unwrap();
        assert!(validate_file(file.path(), false).is_err());
    }
}
