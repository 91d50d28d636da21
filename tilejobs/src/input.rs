//! Reading the persisted job list.

use crate::errors::{DispatchError, Result};
use crate::types::JobDescriptor;
use serde_json::Value;
use std::path::Path;

/// Load the job list once, before anything is dispatched.
///
/// A document starting with `[` is a JSON array of descriptors. Anything else is
/// one descriptor per non-empty line.
pub async fn load_job_list(path: impl AsRef<Path>) -> Result<Vec<JobDescriptor>> {
    let path = path.as_ref();
    let name = path.display().to_string();
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| DispatchError::malformed(&name, e))?;
    parse_job_list(&name, &text)
}

pub fn parse_job_list(source_name: &str, text: &str) -> Result<Vec<JobDescriptor>> {
    let trimmed = text.trim();
    let jobs: Vec<JobDescriptor> = if trimmed.starts_with('[') {
        serde_json::from_str::<Vec<Value>>(trimmed)
            .map_err(|e| DispatchError::malformed(source_name, e))?
            .into_iter()
            .map(JobDescriptor::new)
            .collect()
    } else {
        trimmed
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(JobDescriptor::from)
            .collect()
    };

    if let Some(index) = jobs.iter().position(JobDescriptor::is_blank) {
        return Err(DispatchError::malformed(
            source_name,
            format!("job {index} is empty"),
        ));
    }
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn json_array_of_wkt() {
        let jobs = parse_job_list(
            "wkt.json",
            r#"["POLYGON((0 0,1 0,1 1,0 1,0 0))", "POLYGON((2 2,3 2,3 3,2 3,2 2))"]"#,
        )
        .unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].canonical(), "POLYGON((2 2,3 2,3 3,2 3,2 2))");
    }

    #[test]
    fn lines_skip_blank_entries() {
        let jobs = parse_job_list("tiles.txt", "a\n\n  b  \n").unwrap();
        assert_eq!(jobs, vec![JobDescriptor::from("a"), JobDescriptor::from("b")]);
    }

    #[test]
    fn empty_document_is_an_empty_batch() {
        assert!(parse_job_list("empty", "").unwrap().is_empty());
        assert!(parse_job_list("empty", "[]").unwrap().is_empty());
    }

    #[test]
    fn broken_json_is_malformed() {
        assert_matches!(
            parse_job_list("wkt.json", r#"["POLYGON(("#),
            Err(DispatchError::MalformedInput { .. })
        );
    }

    #[test]
    fn blank_item_is_malformed() {
        assert_matches!(
            parse_job_list("wkt.json", r#"["a", null]"#),
            Err(DispatchError::MalformedInput { reason, .. }) if reason == "job 1 is empty"
        );
    }

    #[tokio::test]
    async fn missing_file_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_job_list(dir.path().join("nope.json")).await.unwrap_err();
        assert_matches!(err, DispatchError::MalformedInput { .. });
    }
}
