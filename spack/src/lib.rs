//! SPACK: a dictionary-indexed tag-length-value codec for task schemas and
//! metric reports, built over [`ntp_buffer`]'s raw byte cursor.
//!
//! The generic TLV engine lives in [`value`]; the fixed field vocabulary in
//! [`keymap`]; the task-catalogue and metric-report domain packers sit on
//! top in [`task`] and [`metrics`].

pub mod keymap;
pub mod metrics;
pub mod task;
pub mod value;

pub use metrics::MetricReport;
pub use task::{
    AlertConditions, DeviceMetrics, GlobalOptions, LinkMetricSpec, LinkMetrics, Mode, NameTable, Target, Task,
    TaskView, TransportKind,
};
pub use value::{Key, SpackError, Value, NAMED_KEY};

pub type Result<T> = std::result::Result<T, SpackError>;

/// Encodes a whole task catalogue (task-id -> [`Task`]) as a single SPACK
/// object, keyed by the task-ids as dynamic names. This is the body of
/// `PUSH_SCHEMAS`.
pub fn pack_task_collection(tasks: &std::collections::BTreeMap<String, Task>) -> Value {
    let fields = tasks
        .iter()
        .map(|(task_id, task)| (Key::Named(task_id.clone()), task.pack()))
        .collect();
    Value::Object(fields)
}

pub fn unpack_task_collection(value: &Value) -> Result<std::collections::BTreeMap<String, Task>> {
    let fields = value.as_object()?;
    let mut out = std::collections::BTreeMap::new();
    for (key, value) in fields {
        match key {
            Key::Named(name) => {
                out.insert(name.clone(), Task::unpack(value)?);
            }
            Key::Id(_) => return Err(SpackError::MissingKeymap),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use task::{DeviceMetrics, GlobalOptions, LinkMetrics};

    #[test]
    fn task_collection_round_trips() {
        let mut tasks = std::collections::BTreeMap::new();
        tasks.insert(
            "ping-gateway".to_string(),
            Task {
                frequency_ms: 1_000,
                device_metrics: DeviceMetrics::default(),
                link_metrics: LinkMetrics::default(),
                global_options: GlobalOptions::default(),
                alert_conditions: AlertConditions::default(),
            },
        );
        let encoded = pack_task_collection(&tasks).encode().unwrap();
        let decoded_value = Value::decode(&encoded).unwrap();
        let decoded = unpack_task_collection(&decoded_value).unwrap();
        assert_eq!(decoded, tasks);
    }
}
