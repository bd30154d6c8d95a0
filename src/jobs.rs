//! Job definitions loaded from TOML files.
//!
//! One job per file. Files without a `.toml` extension are ignored.

use std::path::Path;

use crate::error::{Error, Result};
use crate::model::JobRecord;

/// Parse and validate a single job file.
pub fn load_job_file(path: &Path) -> Result<JobRecord> {
    let content = std::fs::read_to_string(path)?;
    let job: JobRecord = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("bad job file {}: {e}", path.display())))?;
    job.validate()?;
    Ok(job)
}

/// Load every `*.toml` job in `dir`, sorted by job ID.
pub fn load_from_dir(dir: &Path) -> Result<Vec<JobRecord>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::Config(format!("cannot read job dir {}: {e}", dir.display())))?;

    let mut jobs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "toml") {
            jobs.push(load_job_file(&path)?);
        }
    }
    jobs.sort_by_key(|j| j.job_id);

    for pair in jobs.windows(2) {
        if pair[0].job_id == pair[1].job_id {
            return Err(Error::Config(format!(
                "job {} is defined more than once in {}",
                pair[0].job_id,
                dir.display()
            )));
        }
    }
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobId;

    const CONDITION_JOB: &str = r#"
job_id = 12
task_definition_id = 5
expiration_time = "2099-01-01T00:00:00Z"
recurring = false

[target]
target_chain_id = "11155420"
target_contract_address = "0x49a81A591afdDEF973e6e49aaEa7d76943ef234C"
target_function = "execute"
arguments = []

[trigger]
kind = "condition"
condition_type = "greater_than"
upper_limit = 0.0
lower_limit = 100.0
value_source_type = "static"
value_source_url = "150"
"#;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("trigger-dispatch-{name}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn loads_toml_files_and_skips_others() {
        let dir = scratch_dir("load");
        std::fs::write(dir.join("price.toml"), CONDITION_JOB).unwrap();
        std::fs::write(dir.join("README.md"), "not a job").unwrap();

        let jobs = load_from_dir(&dir).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, JobId(12));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn duplicate_job_ids_are_rejected() {
        let dir = scratch_dir("dup");
        std::fs::write(dir.join("a.toml"), CONDITION_JOB).unwrap();
        std::fs::write(dir.join("b.toml"), CONDITION_JOB).unwrap();

        assert!(matches!(load_from_dir(&dir), Err(Error::Config(_))));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn invalid_condition_type_fails_validation() {
        let dir = scratch_dir("invalid");
        let path = dir.join("bad.toml");
        std::fs::write(&path, CONDITION_JOB.replace("greater_than", "sideways")).unwrap();

        assert!(matches!(
            load_job_file(&path),
            Err(Error::InvalidConditionType(t)) if t == "sideways"
        ));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_dir_is_a_config_error() {
        assert!(matches!(
            load_from_dir(Path::new("/definitely/not/here")),
            Err(Error::Config(_))
        ));
    }
}
