/*!
Tests for error construction, attribution and classification.
*/

#[cfg(test)]
mod tests {
    use crate::error::WardenError;
    use crate::model::{ArtifactIdentity, Category};
    use std::io;
    use warden_retry::RetryableError;

    fn agent() -> ArtifactIdentity {
        ArtifactIdentity::for_path("/Library/LaunchAgents/com.example.agent.plist")
    }

    #[test]
    fn test_warden_error_display() {
        let error = WardenError::validation("test validation error");
        assert_eq!(error.to_string(), "Validation error: test validation error");

        let error = WardenError::compression("test compression error");
        assert_eq!(error.to_string(), "Compression error: test compression error");

        let error = WardenError::Storage("test storage error".to_string());
        assert_eq!(error.to_string(), "Storage error: test storage error");
    }

    #[test]
    fn test_artifact_errors_name_identity_and_action() {
        let error = WardenError::InvalidTransition {
            identity: agent(),
            action: "quarantine",
            state: "quarantined".to_string(),
        };
        let message = error.to_string();
        assert!(message.contains("com.example.agent.plist"));
        assert!(message.contains("quarantine"));

        let error = WardenError::UnsupportedOperation {
            category: Category::Port,
            action: "restore",
        };
        assert_eq!(error.to_string(), "restore is not supported for port");
    }

    #[test]
    fn test_from_io_maps_permission_denied() {
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "Operation not permitted");
        match WardenError::from_io(&agent(), "quarantine", denied) {
            WardenError::PermissionDenied { identity, action, .. } => {
                assert_eq!(identity, agent());
                assert_eq!(action, "quarantine");
            }
            other => panic!("Expected PermissionDenied, got {other:?}"),
        }

        let missing = io::Error::new(io::ErrorKind::NotFound, "No such file");
        assert!(matches!(
            WardenError::from_io(&agent(), "restore", missing),
            WardenError::MutationFailed { action: "restore", .. }
        ));
    }

    #[test]
    fn test_warden_error_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        assert!(matches!(WardenError::from(io_error), WardenError::Io(_)));
    }

    #[test]
    fn test_warden_error_from_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(WardenError::from(json_error), WardenError::Json(_)));
    }

    #[test]
    fn test_integrity_failure_error() {
        let error = WardenError::IntegrityFailure {
            identity: agent(),
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };
        assert!(error.to_string().contains("abc123"));
        assert!(error.to_string().contains("def456"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<WardenError>();
        assert_sync::<WardenError>();
    }

    #[test]
    fn test_classification() {
        let contended = WardenError::ConcurrentModification {
            identity: agent(),
            action: "restore",
        };
        assert!(contended.is_transient());
        assert!(!contended.is_fatal());

        let timeline = WardenError::timeline("disk full");
        assert!(timeline.is_fatal());
        assert!(timeline.is_permanent());

        assert!(WardenError::BackupNotFound { identity: agent() }.is_permanent());

        let inconsistent = WardenError::BackupStoreInconsistent {
            identity: agent(),
            action: "quarantine",
            reason: "disk full".to_string(),
        };
        assert!(inconsistent.is_fatal());

        let partial = WardenError::PurgeIncomplete {
            identity: agent(),
            purged: 1,
            total: 3,
            reason: "busy".to_string(),
        };
        assert!(!partial.is_fatal());
        assert!(partial.to_string().contains("com.example.agent.plist"));
        assert!(partial.to_string().contains("1 of 3"));
    }

    #[test]
    fn test_error_result_type() {
        fn returns_error() -> crate::Result<()> {
            Err(WardenError::validation("test error"))
        }

        assert!(returns_error().is_err());
    }
}
