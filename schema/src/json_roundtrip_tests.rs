//! JSON shape tests for schema types
//!
//! Presentation layers consume these types as JSON, so the wire names are
//! pinned here.

#[cfg(test)]
mod tests {
    use crate::process::*;
    use schemars::schema_for;

    #[test]
    fn status_uses_camel_case() {
        let json = serde_json::to_string(&ProcessStatus::TerminatedByUser).unwrap();
        assert_eq!(json, "\"terminatedByUser\"");
        let back: ProcessStatus = serde_json::from_str("\"notStarted\"").unwrap();
        assert_eq!(back, ProcessStatus::NotStarted);
    }

    #[test]
    fn hidden_row_is_tagged() {
        let json = serde_json::to_value(StatusRow::Hidden { count: 4 }).unwrap();
        assert_eq!(json["kind"], "hidden");
        assert_eq!(json["count"], 4);
    }

    #[test]
    fn process_row_omits_missing_pid() {
        let row = StatusRow::Process(ProcessRow {
            os_pid: None,
            process_id: 3,
            status: ProcessStatus::Finished,
            running_duration: "1 second".into(),
            memory_usage: "None".into(),
        });
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["kind"], "process");
        assert_eq!(json["processId"], 3);
        assert!(json.get("osPid").is_none());
        let back: StatusRow = serde_json::from_value(json).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn invocation_args_default_to_empty() {
        let inv: TaskInvocation = serde_json::from_str(r#"{"task":"spin"}"#).unwrap();
        assert!(inv.args.is_empty());
    }

    #[test]
    fn schemas_generate() {
        let snapshot = schema_for!(StatusSnapshot);
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("aliveCount"));
        let _ = schema_for!(TaskInvocation);
    }
}
