#[cfg(test)]
mod tests {
    use crate::error::*;
    use std::error::Error;
    use std::io;

    #[test]
    fn test_core_error_display() {
        let err = CoreError::ValidationError("test validation".to_string());
        assert_eq!(err.to_string(), "Validation error: test validation");

        let err = CoreError::ProcessSignal("kill failed".to_string());
        assert_eq!(err.to_string(), "Process signal error: kill failed");

        let err = CoreError::UnknownTask("frobnicate".to_string());
        assert_eq!(err.to_string(), "Unknown task: frobnicate");

        let err = CoreError::Allocator("corrupt counter".to_string());
        assert_eq!(err.to_string(), "Identifier allocator error: corrupt counter");
    }

    #[test]
    fn test_core_error_from_std_error() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let core_err: CoreError = io_err.into();

        if let CoreError::IoError(_) = core_err {
            // Expected variant
        } else {
            panic!("Expected CoreError::IoError variant");
        }
    }

    #[test]
    fn test_core_error_from_serde_error() {
        let serde_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let core_err: CoreError = serde_err.into();

        assert!(matches!(core_err, CoreError::SerializationError(_)));
        assert!(core_err.source().is_some());
    }

    #[test]
    fn test_io_at_keeps_kind_and_path() {
        let path = std::path::Path::new("/tmp/out/stdout_1.txt");
        let err = CoreError::io_at(path, "read", io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        match err {
            CoreError::IoError(inner) => {
                assert_eq!(inner.kind(), io::ErrorKind::PermissionDenied);
                assert!(inner.to_string().contains("stdout_1.txt"));
            }
            other => panic!("unexpected variant: {other}"),
        }
    }

    #[test]
    fn test_result_type_alias() {
        fn ok() -> Result<u8> {
            Ok(1)
        }
        fn fails() -> Result<u8> {
            Err(CoreError::Other("boom".into()))
        }
        assert_eq!(ok().unwrap(), 1);
        assert!(fails().is_err());
    }
}
