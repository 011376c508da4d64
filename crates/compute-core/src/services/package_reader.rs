use std::path::Path;

use serde_yaml::Value;

use crate::error::{ComputeError, Result};
use crate::models::PackageDescriptor;

pub const DESCRIPTOR_FILENAME: &str = "package.yaml";

const INSTANCES_KEY: &str = "numberOfInstances";

/// Read and validate the package descriptor at `path`.
///
/// Either both `numberOfInstances` and `assembly.name` are well formed and a
/// descriptor is returned, or the whole read fails with
/// [`ComputeError::PackageFormat`] naming `path`.
pub async fn read_package(path: &Path) -> Result<PackageDescriptor> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format_error(path, format!("cannot read descriptor: {e}")))?;
    parse_package(path, &contents)
}

pub fn parse_package(path: &Path, contents: &str) -> Result<PackageDescriptor> {
    let document: Value = serde_yaml::from_str(contents)
        .map_err(|e| format_error(path, format!("not a valid YAML document: {e}")))?;

    let number_of_instances = match document.get(INSTANCES_KEY) {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
    .filter(|n| *n > 0)
    .and_then(|n| usize::try_from(n).ok())
    .ok_or_else(|| {
        format_error(
            path,
            format!("{INSTANCES_KEY} is either missing or not a positive integer"),
        )
    })?;

    let assembly_name = document
        .get("assembly")
        .and_then(|assembly| assembly.get("name"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| format_error(path, "assembly.name is missing or blank".to_string()))?;

    Ok(PackageDescriptor {
        number_of_instances,
        assembly_name: assembly_name.to_string(),
    })
}

fn format_error(path: &Path, reason: String) -> ComputeError {
    ComputeError::PackageFormat {
        path: path.to_path_buf(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn descriptor_path() -> PathBuf {
        PathBuf::from("/pkg").join(DESCRIPTOR_FILENAME)
    }

    #[test]
    fn parse_well_formed_descriptor() {
        let yaml = "numberOfInstances: 3\nassembly:\n  name: App.dll\n";
        let package = parse_package(&descriptor_path(), yaml).unwrap();
        assert_eq!(
            package,
            PackageDescriptor {
                number_of_instances: 3,
                assembly_name: "App.dll".into(),
            }
        );
    }

    #[test]
    fn numeric_string_count_and_extra_fields_are_accepted() {
        let yaml = "version: 7\nnumberOfInstances: \"2\"\nassembly:\n  name: \"  Worker.dll \"\n  entry: Main\n";
        let package = parse_package(&descriptor_path(), yaml).unwrap();
        assert_eq!(package.number_of_instances, 2);
        assert_eq!(package.assembly_name, "Worker.dll");
    }

    #[test]
    fn missing_instance_count_fails_naming_the_path() {
        let yaml = "assembly:\n  name: App.dll\n";
        let err = parse_package(&descriptor_path(), yaml).unwrap_err();
        match err {
            ComputeError::PackageFormat { path, reason } => {
                assert_eq!(path, descriptor_path());
                assert!(reason.contains(INSTANCES_KEY));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn non_numeric_count_fails() {
        let yaml = "numberOfInstances: three\nassembly:\n  name: App.dll\n";
        assert!(matches!(
            parse_package(&descriptor_path(), yaml),
            Err(ComputeError::PackageFormat { .. })
        ));
    }

    #[test]
    fn zero_or_negative_count_fails() {
        for count in ["0", "-2"] {
            let yaml = format!("numberOfInstances: {count}\nassembly:\n  name: App.dll\n");
            assert!(parse_package(&descriptor_path(), &yaml).is_err());
        }
    }

    #[test]
    fn blank_assembly_name_fails() {
        let yaml = "numberOfInstances: 1\nassembly:\n  name: \"   \"\n";
        let err = parse_package(&descriptor_path(), yaml).unwrap_err();
        assert!(err.to_string().contains("assembly.name"));
    }

    #[test]
    fn missing_assembly_section_fails() {
        let yaml = "numberOfInstances: 1\n";
        assert!(parse_package(&descriptor_path(), yaml).is_err());
    }

    #[test]
    fn garbage_document_fails() {
        assert!(matches!(
            parse_package(&descriptor_path(), "[unclosed"),
            Err(ComputeError::PackageFormat { .. })
        ));
    }

    #[tokio::test]
    async fn read_missing_file_fails_with_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DESCRIPTOR_FILENAME);
        assert!(matches!(
            read_package(&path).await,
            Err(ComputeError::PackageFormat { .. })
        ));
    }

    #[tokio::test]
    async fn read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DESCRIPTOR_FILENAME);
        fs::write(&path, "numberOfInstances: 5\nassembly:\n  name: Svc.dll\n").unwrap();
        let package = read_package(&path).await.unwrap();
        assert_eq!(package.number_of_instances, 5);
    }
}
