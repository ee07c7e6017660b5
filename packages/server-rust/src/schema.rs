//! Loading service schemas from JSON files.

use std::path::Path;

use anyhow::Context;
use courier_core::ServiceSchema;

/// Reads a [`ServiceSchema`] from a JSON file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a valid schema.
pub fn load_service_schema(path: impl AsRef<Path>) -> anyhow::Result<ServiceSchema> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading schema {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing schema {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn loads_schema_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "schemaId": "orders",
                "basePath": "/orders",
                "operations": [
                    {{ "operationId": "list", "path": "/" }},
                    {{
                        "operationId": "get",
                        "path": "/{{id}}",
                        "parameters": [{{ "name": "id", "in": "path" }}]
                    }}
                ]
            }}"#
        )
        .unwrap();

        let schema = load_service_schema(file.path()).unwrap();
        assert_eq!(schema.schema_id, "orders");
        assert_eq!(schema.operations.len(), 2);
        assert_eq!(schema.operations[1].parameters[0].name, "id");
    }

    #[test]
    fn reports_missing_and_malformed_files() {
        let err = load_service_schema("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("reading schema"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = load_service_schema(file.path()).unwrap_err();
        assert!(err.to_string().contains("parsing schema"));
    }
}
