//! Patch lifecycle: validate -> apply -> verify, with rollback on failed verification.
//!
//! A patch is never left applied-but-unverified: `verify_patch` rolls back
//! before it reports a verification failure.

use std::path::PathBuf;

use agentbridge_core::{Error, PatchRecord, PatchStatus, Result, ValidationResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{error, info, warn};

use crate::layout::{move_into, read_json};
use crate::validation::{is_plain_name, ValidationEngine};

/// Side effects of the lifecycle. The engine owns the state machine; the
/// backend only touches the outside world.
#[async_trait]
pub trait PatchBackend: Send + Sync {
    async fn apply(&self, patch: &PatchRecord) -> Result<()>;

    /// `Err` means the patch did not pass; the message becomes the failure reason.
    async fn verify(&self, patch: &PatchRecord) -> Result<()>;

    async fn rollback(&self, patch: &PatchRecord) -> Result<()>;
}

/// Confirmation written by the external test runner into `validated/<patch_id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfirmation {
    pub test_id: String,
    pub passed: bool,
    #[serde(default)]
    pub details: Option<String>,
}

/// Stages patches as files and verifies against confirmations in `validated/`.
pub struct FsPatchBackend {
    patches_dir: PathBuf,
    validated_dir: PathBuf,
}

impl FsPatchBackend {
    pub fn new(patches_dir: impl Into<PathBuf>, validated_dir: impl Into<PathBuf>) -> Self {
        Self {
            patches_dir: patches_dir.into(),
            validated_dir: validated_dir.into(),
        }
    }

    pub fn staged_path(&self, patch_id: &str) -> PathBuf {
        self.patches_dir.join(format!("{patch_id}.patch"))
    }

    pub fn rolled_back_dir(&self) -> PathBuf {
        self.patches_dir.join("rolled_back")
    }

    fn confirmation_path(&self, patch_id: &str) -> PathBuf {
        self.validated_dir.join(format!("{patch_id}.json"))
    }
}

#[async_trait]
impl PatchBackend for FsPatchBackend {
    async fn apply(&self, patch: &PatchRecord) -> Result<()> {
        fs::create_dir_all(&self.patches_dir).await?;
        fs::write(self.staged_path(&patch.patch_id), &patch.content).await?;
        Ok(())
    }

    async fn verify(&self, patch: &PatchRecord) -> Result<()> {
        let path = self.confirmation_path(&patch.patch_id);
        let confirmation: TestConfirmation = read_json(&path)
            .await?
            .ok_or_else(|| Error::processing(format!("no confirmation at {}", path.display())))?;
        if confirmation.test_id != patch.test_id {
            return Err(Error::processing(format!(
                "confirmation is for test {} not {}",
                confirmation.test_id, patch.test_id
            )));
        }
        if !confirmation.passed {
            return Err(Error::processing(
                confirmation.details.unwrap_or_else(|| format!("test {} failed", patch.test_id)),
            ));
        }
        Ok(())
    }

    async fn rollback(&self, patch: &PatchRecord) -> Result<()> {
        let staged = self.staged_path(&patch.patch_id);
        if !staged.exists() {
            return Ok(());
        }
        move_into(&staged, &self.rolled_back_dir(), "").await?;
        Ok(())
    }
}

impl ValidationEngine {
    /// Check a patch and register it as `pending`. An invalid patch is recorded as `failed`.
    pub fn validate_patch(
        &self,
        patch_id: &str,
        content: &str,
        test_id: &str,
        agent_id: &str,
    ) -> ValidationResult {
        let mut result = ValidationResult::ok();
        for (field, value) in [("patch_id", patch_id), ("test_id", test_id), ("agent_id", agent_id)] {
            if value.trim().is_empty() {
                result.push_error(format!("{field} is empty"));
            }
        }
        if !patch_id.trim().is_empty() && !is_plain_name(patch_id) {
            result.push_error(format!("patch_id '{patch_id}' is not a plain name"));
        }
        if content.trim().is_empty() {
            result.push_error("patch content is empty");
        }
        if let Some(existing) = self.patches.get(patch_id) {
            if matches!(existing.status, PatchStatus::Applied | PatchStatus::Verified) {
                result.push_error(format!("patch {patch_id} is already {}", existing.status));
                return result;
            }
        }

        let mut record = PatchRecord::new(patch_id, test_id, agent_id, content);
        if !result.is_valid {
            record.status = PatchStatus::Failed;
            warn!(patch_id, errors = ?result.errors, "Patch rejected");
        }
        self.patches.insert(patch_id.to_string(), record);
        result
    }

    pub async fn apply_patch(&self, patch_id: &str, test_id: &str) -> Result<()> {
        let record = self.expect_patch(patch_id, test_id, PatchStatus::Pending)?;
        if let Err(e) = self.backend.apply(&record).await {
            self.set_status(patch_id, PatchStatus::Failed)?;
            return Err(Error::processing(format!("apply {patch_id}: {e}")));
        }
        self.set_status(patch_id, PatchStatus::Applied)?;
        info!(patch_id, test_id, "Patch applied");
        Ok(())
    }

    /// Verify an applied patch. On failure the patch is rolled back first and
    /// the error is `PatchVerification`.
    pub async fn verify_patch(&self, patch_id: &str, test_id: &str) -> Result<()> {
        let record = self.expect_patch(patch_id, test_id, PatchStatus::Applied)?;
        let reason = match self.backend.verify(&record).await {
            Ok(()) => {
                self.set_status(patch_id, PatchStatus::Verified)?;
                info!(patch_id, test_id, "Patch verified");
                return Ok(());
            }
            Err(e) => e.to_string(),
        };

        warn!(patch_id, test_id, %reason, "Patch verification failed, rolling back");
        if let Err(rollback_err) = self.rollback_patch(patch_id, test_id).await {
            error!(patch_id, error = %rollback_err, "Rollback failed");
            self.set_status(patch_id, PatchStatus::Failed)?;
            return Err(Error::patch_verification(
                patch_id,
                format!("{reason}; rollback failed: {rollback_err}"),
            ));
        }
        Err(Error::patch_verification(patch_id, reason))
    }

    pub async fn rollback_patch(&self, patch_id: &str, test_id: &str) -> Result<()> {
        let record = self.expect_patch(patch_id, test_id, PatchStatus::Applied)?;
        self.backend.rollback(&record).await?;
        self.set_status(patch_id, PatchStatus::RolledBack)?;
        info!(patch_id, test_id, "Patch rolled back");
        Ok(())
    }

    pub fn patch(&self, patch_id: &str) -> Option<PatchRecord> {
        self.patches.get(patch_id).map(|r| r.clone())
    }

    fn expect_patch(&self, patch_id: &str, test_id: &str, status: PatchStatus) -> Result<PatchRecord> {
        let record = self
            .patch(patch_id)
            .ok_or_else(|| Error::validation(vec![format!("unknown patch {patch_id}")]))?;
        if record.test_id != test_id {
            return Err(Error::validation(vec![format!(
                "patch {patch_id} belongs to test {}, not {test_id}",
                record.test_id
            )]));
        }
        if record.status != status {
            return Err(Error::invalid_transition(record.status, format!("expected {status}")));
        }
        Ok(record)
    }

    fn set_status(&self, patch_id: &str, next: PatchStatus) -> Result<()> {
        match self.patches.get_mut(patch_id) {
            Some(mut record) => record.transition(next),
            None => Err(Error::validation(vec![format!("unknown patch {patch_id}")])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Records the order of backend calls.
    #[derive(Default)]
    struct ScriptedBackend {
        calls: Mutex<Vec<String>>,
        fail_verify: AtomicBool,
        fail_rollback: AtomicBool,
    }

    #[async_trait]
    impl PatchBackend for ScriptedBackend {
        async fn apply(&self, p: &PatchRecord) -> Result<()> {
            self.calls.lock().unwrap().push(format!("apply:{}", p.patch_id));
            Ok(())
        }

        async fn verify(&self, p: &PatchRecord) -> Result<()> {
            self.calls.lock().unwrap().push(format!("verify:{}", p.patch_id));
            if self.fail_verify.load(Ordering::SeqCst) {
                Err(Error::processing("3 tests failed"))
            } else {
                Ok(())
            }
        }

        async fn rollback(&self, p: &PatchRecord) -> Result<()> {
            self.calls.lock().unwrap().push(format!("rollback:{}", p.patch_id));
            if self.fail_rollback.load(Ordering::SeqCst) {
                Err(Error::processing("disk full"))
            } else {
                Ok(())
            }
        }
    }

    fn engine_with(backend: Arc<ScriptedBackend>) -> ValidationEngine {
        ValidationEngine::new(backend)
    }

    #[tokio::test]
    async fn full_lifecycle_verifies() {
        let backend = Arc::new(ScriptedBackend::default());
        let engine = engine_with(backend.clone());
        assert!(engine.validate_patch("p1", "diff", "t1", "w1").is_valid);
        engine.apply_patch("p1", "t1").await.unwrap();
        engine.verify_patch("p1", "t1").await.unwrap();
        assert_eq!(engine.patch("p1").unwrap().status, PatchStatus::Verified);
        assert_eq!(*backend.calls.lock().unwrap(), vec!["apply:p1", "verify:p1"]);
    }

    #[tokio::test]
    async fn failed_verify_rolls_back_before_returning() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.fail_verify.store(true, Ordering::SeqCst);
        let engine = engine_with(backend.clone());
        engine.validate_patch("p1", "diff", "t1", "w1");
        engine.apply_patch("p1", "t1").await.unwrap();

        let err = engine.verify_patch("p1", "t1").await.unwrap_err();
        assert_eq!(err.kind(), "patch_verification");
        assert!(err.to_string().contains("3 tests failed"));
        assert_eq!(engine.patch("p1").unwrap().status, PatchStatus::RolledBack);
        assert_eq!(
            *backend.calls.lock().unwrap(),
            vec!["apply:p1", "verify:p1", "rollback:p1"]
        );
    }

    #[tokio::test]
    async fn failed_rollback_never_leaves_patch_applied() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.fail_verify.store(true, Ordering::SeqCst);
        backend.fail_rollback.store(true, Ordering::SeqCst);
        let engine = engine_with(backend.clone());
        engine.validate_patch("p1", "diff", "t1", "w1");
        engine.apply_patch("p1", "t1").await.unwrap();

        let err = engine.verify_patch("p1", "t1").await.unwrap_err();
        assert!(err.to_string().contains("rollback failed"));
        assert_ne!(engine.patch("p1").unwrap().status, PatchStatus::Applied);
    }

    #[tokio::test]
    async fn invalid_patch_is_recorded_failed_and_cannot_apply() {
        let engine = engine_with(Arc::new(ScriptedBackend::default()));
        let r = engine.validate_patch("p1", "   ", "t1", "w1");
        assert!(!r.is_valid);
        assert_eq!(engine.patch("p1").unwrap().status, PatchStatus::Failed);
        assert!(engine.apply_patch("p1", "t1").await.is_err());
    }

    #[tokio::test]
    async fn patch_id_with_path_parts_is_never_staged() {
        let backend = Arc::new(ScriptedBackend::default());
        let engine = engine_with(backend.clone());
        let r = engine.validate_patch("../../escaped", "PWNED", "t1", "w1");
        assert!(!r.is_valid);
        assert!(r.errors[0].contains("not a plain name"));
        assert!(engine.apply_patch("../../escaped", "t1").await.is_err());
        assert!(backend.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn verify_requires_apply_first() {
        let engine = engine_with(Arc::new(ScriptedBackend::default()));
        engine.validate_patch("p1", "diff", "t1", "w1");
        let err = engine.verify_patch("p1", "t1").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
    }

    #[tokio::test]
    async fn wrong_test_id_rejected() {
        let engine = engine_with(Arc::new(ScriptedBackend::default()));
        engine.validate_patch("p1", "diff", "t1", "w1");
        let err = engine.apply_patch("p1", "t2").await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn applied_patch_cannot_be_resubmitted() {
        let engine = engine_with(Arc::new(ScriptedBackend::default()));
        engine.validate_patch("p1", "diff", "t1", "w1");
        engine.apply_patch("p1", "t1").await.unwrap();
        let r = engine.validate_patch("p1", "diff2", "t1", "w1");
        assert!(!r.is_valid);
        assert_eq!(engine.patch("p1").unwrap().status, PatchStatus::Applied);
    }

    #[tokio::test]
    async fn fs_backend_stages_verifies_and_rolls_back() {
        let tmp = TempDir::new().unwrap();
        let patches = tmp.path().join("patches");
        let validated = tmp.path().join("validated");
        std::fs::create_dir_all(&validated).unwrap();
        let backend = FsPatchBackend::new(&patches, &validated);
        let record = PatchRecord::new("p9", "t9", "w1", "--- a\n+++ b\n");

        backend.apply(&record).await.unwrap();
        assert!(backend.staged_path("p9").exists());

        // No confirmation yet.
        assert!(backend.verify(&record).await.is_err());

        std::fs::write(validated.join("p9.json"), r#"{"test_id":"t9","passed":false,"details":"boom"}"#).unwrap();
        let err = backend.verify(&record).await.unwrap_err();
        assert!(err.to_string().contains("boom"));

        std::fs::write(validated.join("p9.json"), r#"{"test_id":"t9","passed":true}"#).unwrap();
        backend.verify(&record).await.unwrap();

        backend.rollback(&record).await.unwrap();
        assert!(!backend.staged_path("p9").exists());
        assert!(backend.rolled_back_dir().join("p9.patch").exists());
    }
}
