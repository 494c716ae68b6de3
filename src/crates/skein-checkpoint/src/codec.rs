//! Gzip JSON codec with atomic writes.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use skein_core::state::WorkflowExecution;

use crate::dto::{from_dto, to_dto, WorkflowExecutionDto};
use crate::error::Result;

/// Serialize an execution to gzip-compressed JSON.
pub fn dumps_gzip(execution: &WorkflowExecution) -> Result<Vec<u8>> {
    let dto = to_dto(execution);
    let raw = serde_json::to_vec(&dto)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    Ok(encoder.finish()?)
}

/// Deserialize an execution from gzip-compressed JSON.
pub fn loads_gzip(data: &[u8]) -> Result<WorkflowExecution> {
    let mut decoder = GzDecoder::new(data);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    let dto: WorkflowExecutionDto = serde_json::from_slice(&raw)?;
    Ok(from_dto(&dto))
}

/// Write an execution to disk atomically (write-to-temp plus rename).
pub fn save_to_path(path: &Path, execution: &WorkflowExecution) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = dumps_gzip(execution)?;
    let tmp = path.with_extension("gz.tmp");
    fs::write(&tmp, &data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn load_from_path(path: &Path) -> Result<WorkflowExecution> {
    let data = fs::read(path)?;
    loads_gzip(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::state::{Message, NodeExecution, OpaqueState, Step, StepType};

    fn sample_execution() -> WorkflowExecution {
        let mut run = WorkflowExecution::new("wf-codec");
        let mut first = NodeExecution::new("a");
        first.input_messages = vec![Message::user("hi")];
        first.state = Some(OpaqueState {
            model: Some("llm.StepState".into()),
            data: serde_json::json!({"round": 2}).as_object().unwrap().clone(),
        });
        let first_id = first.id;
        run.insert_node_execution(first);
        run.upsert_step(
            Step::new(first_id, StepType::OutputMessage)
                .with_message(Message::assistant("hello"))
                .with_outcome("done"),
        );

        let mut second = NodeExecution::new("a");
        second.previous_id = Some(first_id);
        let second_id = second.id;
        run.insert_node_execution(second);
        run.upsert_step(
            Step::new(second_id, StepType::InputMessage).with_message(Message::user("again")),
        );
        run
    }

    #[test]
    fn dto_round_trip_preserves_state() {
        let run = sample_execution();
        let dto = crate::dto::to_dto(&run);
        let restored = crate::dto::from_dto(&dto);
        assert_eq!(restored, run);
    }

    #[test]
    fn gzip_round_trip() {
        let run = sample_execution();
        let bytes = dumps_gzip(&run).unwrap();
        // Gzip magic header.
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        let restored = loads_gzip(&bytes).unwrap();
        assert_eq!(restored, run);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let run = sample_execution();
        let path = dir.path().join(format!("{}.json.gz", run.id));
        save_to_path(&path, &run).unwrap();
        // No temp file left behind.
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
        let restored = load_from_path(&path).unwrap();
        assert_eq!(restored, run);
    }

    #[test]
    fn enums_are_stored_as_strings() {
        let run = sample_execution();
        let dto = crate::dto::to_dto(&run);
        let json = serde_json::to_value(&dto).unwrap();
        assert_eq!(json["steps"][0]["type"], "output_message");
        let status = json["node_executions"]
            .as_object()
            .unwrap()
            .values()
            .next()
            .unwrap()["status"]
            .clone();
        assert_eq!(status, serde_json::json!("running"));
    }
}
