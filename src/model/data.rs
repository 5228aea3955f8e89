use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key of the section holding run metadata (job id, task id, timestamp).
pub const META_KEY: &str = "meta";
/// Key of the section holding the payload actions work on.
pub const DATA_KEY: &str = "data";
/// Key actions use to explain what they would have done during a simulation.
pub const SIMULATION_LOG_KEY: &str = "simulationLog";

/// One structured record flowing through a task's action pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataItem(Map<String, Value>);

impl DataItem {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builds the first item of a run: run metadata plus the trigger's payload.
    pub fn initial(
        job_id: &str,
        task_id: &str,
        trigger_meta: Map<String, Value>,
        data: Map<String, Value>,
    ) -> Self {
        let mut meta = Map::new();
        meta.insert("jobId".into(), Value::String(job_id.to_string()));
        meta.insert("taskId".into(), Value::String(task_id.to_string()));
        meta.insert(
            "timestamp".into(),
            Value::from(Utc::now().timestamp_millis()),
        );
        meta.extend(trigger_meta);

        let mut item = Self::new();
        item.insert(META_KEY, Value::Object(meta));
        item.insert(DATA_KEY, Value::Object(data));
        item
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Looks up a dotted path like `data.file.name` through nested objects.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.0.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    pub fn lookup_mut(&mut self, path: &str) -> Option<&mut Value> {
        let mut segments = path.split('.');
        let mut current = self.0.get_mut(segments.next()?)?;
        for segment in segments {
            current = current.as_object_mut()?.get_mut(segment)?;
        }
        Some(current)
    }

    /// The `data` section, created on demand.
    pub fn data_mut(&mut self) -> &mut Map<String, Value> {
        let entry = self
            .0
            .entry(DATA_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        match entry {
            Value::Object(map) => map,
            _ => unreachable!("data section was just replaced by an object"),
        }
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for DataItem {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn initial_item_carries_meta_and_data() {
        let mut trigger_meta = Map::new();
        trigger_meta.insert("trigger".into(), json!("manual"));
        let mut data = Map::new();
        data.insert("answer".into(), json!(42));

        let item = DataItem::initial("job-1", "task-1", trigger_meta, data);

        assert_eq!(item.lookup("meta.jobId"), Some(&json!("job-1")));
        assert_eq!(item.lookup("meta.taskId"), Some(&json!("task-1")));
        assert_eq!(item.lookup("meta.trigger"), Some(&json!("manual")));
        assert!(item.lookup("meta.timestamp").is_some());
        assert_eq!(item.lookup("data.answer"), Some(&json!(42)));
    }

    #[test]
    fn lookup_misses_on_non_objects() {
        let item: DataItem = serde_json::from_value(json!({"data": {"name": "a"}})).unwrap();
        assert_eq!(item.lookup("data.name.first"), None);
        assert_eq!(item.lookup("other"), None);
    }

    #[test]
    fn data_mut_replaces_non_object_section() {
        let mut item: DataItem = serde_json::from_value(json!({"data": 5})).unwrap();
        item.data_mut().insert("x".into(), json!(true));
        assert_eq!(item.lookup("data.x"), Some(&json!(true)));
    }
}
