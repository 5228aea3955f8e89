//! General purpose actions: counting filters, fan-out, enrichment, pauses.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::template;
use super::{Action, ActionMeta, ExecutionContext};
use crate::error::ActionError;
use crate::model::{DataItem, SIMULATION_LOG_KEY};

pub const CATEGORY: &str = "util";

/// Drops the first `number` items and passes every later one unchanged.
pub struct SkipAction {
    meta: ActionMeta,
    number: usize,
    processed: AtomicUsize,
}

impl SkipAction {
    pub const TYPE_ID: &'static str = "skip";

    pub fn new(meta: ActionMeta, number: usize) -> Self {
        Self {
            meta: meta.with_type(CATEGORY, Self::TYPE_ID),
            number,
            processed: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Action for SkipAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    // Counting is only meaningful in arrival order.
    fn max_parallelism(&self) -> Option<usize> {
        Some(1)
    }

    async fn setup(&self, _ctx: &ExecutionContext) -> Result<(), ActionError> {
        self.processed.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn process(
        &self,
        item: DataItem,
        _ctx: &ExecutionContext,
    ) -> Result<Vec<DataItem>, ActionError> {
        let seen = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        if seen <= self.number {
            Ok(Vec::new())
        } else {
            Ok(vec![item])
        }
    }
}

/// Passes the first `number` items and drops every later one.
pub struct LimitAction {
    meta: ActionMeta,
    number: usize,
    processed: AtomicUsize,
}

impl LimitAction {
    pub const TYPE_ID: &'static str = "limit";

    pub fn new(meta: ActionMeta, number: usize) -> Self {
        Self {
            meta: meta.with_type(CATEGORY, Self::TYPE_ID),
            number,
            processed: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Action for LimitAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn max_parallelism(&self) -> Option<usize> {
        Some(1)
    }

    async fn setup(&self, _ctx: &ExecutionContext) -> Result<(), ActionError> {
        self.processed.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn process(
        &self,
        item: DataItem,
        _ctx: &ExecutionContext,
    ) -> Result<Vec<DataItem>, ActionError> {
        let seen = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        if seen <= self.number {
            Ok(vec![item])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Emits `amount` identical copies of every item.
pub struct DuplicateAction {
    meta: ActionMeta,
    amount: usize,
}

impl DuplicateAction {
    pub const TYPE_ID: &'static str = "duplicate";

    pub fn new(meta: ActionMeta, amount: usize) -> Self {
        Self {
            meta: meta.with_type(CATEGORY, Self::TYPE_ID),
            amount,
        }
    }
}

#[async_trait]
impl Action for DuplicateAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    async fn process(
        &self,
        item: DataItem,
        _ctx: &ExecutionContext,
    ) -> Result<Vec<DataItem>, ActionError> {
        Ok(vec![item; self.amount])
    }
}

/// Merges a fixed JSON object into the item's `data` section.
pub struct AddDataAction {
    meta: ActionMeta,
    values: Map<String, Value>,
}

impl AddDataAction {
    pub const TYPE_ID: &'static str = "add-data";

    pub fn new(meta: ActionMeta, values: Map<String, Value>) -> Self {
        Self {
            meta: meta.with_type(CATEGORY, Self::TYPE_ID),
            values,
        }
    }
}

#[async_trait]
impl Action for AddDataAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    async fn process(
        &self,
        mut item: DataItem,
        _ctx: &ExecutionContext,
    ) -> Result<Vec<DataItem>, ActionError> {
        let data = item.data_mut();
        for (key, value) in &self.values {
            data.insert(key.clone(), value.clone());
        }
        Ok(vec![item])
    }
}

/// Keeps items whose resolved `input` matches `pattern` (or does not, when
/// `invert` is set). Items whose input cannot be resolved are dropped.
pub struct FilterByRegexAction {
    meta: ActionMeta,
    input: String,
    pattern: Regex,
    invert: bool,
}

impl FilterByRegexAction {
    pub const TYPE_ID: &'static str = "filter-regex";

    pub fn new(
        meta: ActionMeta,
        input: impl Into<String>,
        pattern: &str,
        invert: bool,
    ) -> Result<Self, ActionError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| ActionError::config(format!("invalid pattern '{pattern}': {e}")))?;
        Ok(Self {
            meta: meta.with_type(CATEGORY, Self::TYPE_ID),
            input: input.into(),
            pattern,
            invert,
        })
    }
}

#[async_trait]
impl Action for FilterByRegexAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    async fn process(
        &self,
        item: DataItem,
        _ctx: &ExecutionContext,
    ) -> Result<Vec<DataItem>, ActionError> {
        let Some(input) = template::resolve(&self.input, &item) else {
            return Ok(Vec::new());
        };
        if self.pattern.is_match(&input) != self.invert {
            Ok(vec![item])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Splits the array at `array_selector` into one item per element. Every
/// copy keeps the rest of the item and holds a single element where the
/// array was. Items without an array there produce nothing.
pub struct SplitArrayAction {
    meta: ActionMeta,
    path: String,
}

impl SplitArrayAction {
    pub const TYPE_ID: &'static str = "split-array";

    /// `array_selector` is a dotted path, with or without `{{ }}`.
    pub fn new(meta: ActionMeta, array_selector: &str) -> Result<Self, ActionError> {
        let path = array_selector
            .trim()
            .trim_start_matches("{{")
            .trim_end_matches("}}")
            .trim();
        if path.is_empty() {
            return Err(ActionError::config("array selector is empty"));
        }
        Ok(Self {
            meta: meta.with_type(CATEGORY, Self::TYPE_ID),
            path: path.to_string(),
        })
    }
}

#[async_trait]
impl Action for SplitArrayAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    async fn process(
        &self,
        item: DataItem,
        _ctx: &ExecutionContext,
    ) -> Result<Vec<DataItem>, ActionError> {
        let Some(Value::Array(elements)) = item.lookup(&self.path) else {
            return Ok(Vec::new());
        };
        Ok(elements
            .iter()
            .map(|element| {
                let mut copy = item.clone();
                if let Some(slot) = copy.lookup_mut(&self.path) {
                    *slot = element.clone();
                }
                copy
            })
            .collect())
    }
}

/// How a timestamp value is written in the data item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampFormat {
    EpochMillis,
    EpochSeconds,
    Rfc3339,
    /// A chrono `strftime` pattern, read as UTC.
    Pattern(String),
}

impl TimestampFormat {
    pub fn parse(format: &str) -> Self {
        match format {
            "epoch-millis" => Self::EpochMillis,
            "epoch-seconds" => Self::EpochSeconds,
            "rfc3339" => Self::Rfc3339,
            pattern => Self::Pattern(pattern.to_string()),
        }
    }

    fn read(&self, input: &str) -> Option<DateTime<Utc>> {
        let input = input.trim();
        match self {
            Self::EpochMillis => DateTime::from_timestamp_millis(input.parse().ok()?),
            Self::EpochSeconds => DateTime::from_timestamp(input.parse().ok()?, 0),
            Self::Rfc3339 => DateTime::parse_from_rfc3339(input)
                .ok()
                .map(|time| time.with_timezone(&Utc)),
            Self::Pattern(pattern) => {
                let naive = NaiveDateTime::parse_from_str(input, pattern).ok().or_else(|| {
                    NaiveDate::parse_from_str(input, pattern)
                        .ok()?
                        .and_hms_opt(0, 0, 0)
                })?;
                Some(Utc.from_utc_datetime(&naive))
            }
        }
    }
}

/// `amount` of `unit` (seconds, minutes, hours, days, weeks) as a time span.
pub fn time_span(amount: u64, unit: &str) -> Option<TimeDelta> {
    let unit_secs: u64 = match unit.to_ascii_lowercase().as_str() {
        "seconds" => 1,
        "minutes" => 60,
        "hours" => 3_600,
        "days" => 86_400,
        "weeks" => 604_800,
        _ => return None,
    };
    TimeDelta::try_seconds(i64::try_from(amount.checked_mul(unit_secs)?).ok()?)
}

/// Drops items whose timestamp at `input` is older than `span` (or younger,
/// with `older_than` unset). Items without a timestamp are dropped too.
pub struct FilterByTimestampAction {
    meta: ActionMeta,
    input: String,
    span: TimeDelta,
    older_than: bool,
    format: TimestampFormat,
}

impl FilterByTimestampAction {
    pub const TYPE_ID: &'static str = "filter-by-timestamp";

    pub fn new(
        meta: ActionMeta,
        input: impl Into<String>,
        span: TimeDelta,
        older_than: bool,
        format: TimestampFormat,
    ) -> Self {
        Self {
            meta: meta.with_type(CATEGORY, Self::TYPE_ID),
            input: input.into(),
            span,
            older_than,
            format,
        }
    }
}

#[async_trait]
impl Action for FilterByTimestampAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    async fn process(
        &self,
        item: DataItem,
        _ctx: &ExecutionContext,
    ) -> Result<Vec<DataItem>, ActionError> {
        let Some(input) = template::resolve(&self.input, &item) else {
            debug!("no timestamp at '{}', dropping item", self.input);
            return Ok(Vec::new());
        };
        let actual = self.format.read(&input).ok_or_else(|| {
            ActionError::config(format!("'{input}' is not a timestamp in format {:?}", self.format))
        })?;

        let threshold = Utc::now() - self.span;
        let keep = if self.older_than {
            actual >= threshold
        } else {
            actual <= threshold
        };
        Ok(if keep { vec![item] } else { Vec::new() })
    }
}

/// Waits before passing the item on. Honors cancellation while waiting and
/// does not wait at all during a simulation.
pub struct PauseAction {
    meta: ActionMeta,
    duration: Duration,
}

impl PauseAction {
    pub const TYPE_ID: &'static str = "pause";

    pub fn new(meta: ActionMeta, duration: Duration) -> Self {
        Self {
            meta: meta.with_type(CATEGORY, Self::TYPE_ID),
            duration,
        }
    }
}

#[async_trait]
impl Action for PauseAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    async fn process(
        &self,
        mut item: DataItem,
        ctx: &ExecutionContext,
    ) -> Result<Vec<DataItem>, ActionError> {
        if ctx.simulation {
            item.insert(
                SIMULATION_LOG_KEY,
                Value::String(format!(
                    "Would have paused for {} milliseconds.",
                    self.duration.as_millis()
                )),
            );
            return Ok(vec![item]);
        }

        let wip = ctx.work_in_progress(&self.meta.name);
        tokio::select! {
            _ = wip.cancelled() => Err(ActionError::Cancelled),
            _ = tokio::time::sleep(self.duration) => {
                wip.set_progress(100.0);
                Ok(vec![item])
            }
        }
    }
}

/// Logs every item and passes it on unchanged.
pub struct LogAction {
    meta: ActionMeta,
    message: String,
}

impl LogAction {
    pub const TYPE_ID: &'static str = "log";

    pub fn new(meta: ActionMeta, message: impl Into<String>) -> Self {
        Self {
            meta: meta.with_type(CATEGORY, Self::TYPE_ID),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Action for LogAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    async fn process(
        &self,
        item: DataItem,
        ctx: &ExecutionContext,
    ) -> Result<Vec<DataItem>, ActionError> {
        let message = template::resolve(&self.message, &item).unwrap_or_else(|| self.message.clone());
        let payload = serde_json::to_string(&item)?;
        info!(job = %ctx.job_id, task = %ctx.task_name, "{message}: {payload}");
        Ok(vec![item])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::testing::{context, simulation_context};
    use serde_json::json;

    fn item(value: Value) -> DataItem {
        serde_json::from_value(json!({ "data": value })).unwrap()
    }

    #[tokio::test]
    async fn skip_drops_first_items() {
        let ctx = context();
        let action = SkipAction::new(ActionMeta::new("skip"), 2);
        action.setup(&ctx).await.unwrap();

        assert!(action.process(item(json!(1)), &ctx).await.unwrap().is_empty());
        assert!(action.process(item(json!(2)), &ctx).await.unwrap().is_empty());
        assert_eq!(
            action.process(item(json!(3)), &ctx).await.unwrap(),
            vec![item(json!(3))]
        );
    }

    #[tokio::test]
    async fn skip_counter_resets_on_setup() {
        let ctx = context();
        let action = SkipAction::new(ActionMeta::new("skip"), 1);
        action.setup(&ctx).await.unwrap();
        action.process(item(json!(1)), &ctx).await.unwrap();
        action.setup(&ctx).await.unwrap();
        assert!(action.process(item(json!(2)), &ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn limit_passes_first_items() {
        let ctx = context();
        let action = LimitAction::new(ActionMeta::new("limit"), 1);
        action.setup(&ctx).await.unwrap();
        assert_eq!(action.process(item(json!(1)), &ctx).await.unwrap().len(), 1);
        assert!(action.process(item(json!(2)), &ctx).await.unwrap().is_empty());
        assert_eq!(action.max_parallelism(), Some(1));
    }

    #[tokio::test]
    async fn duplicate_emits_identical_copies() {
        let action = DuplicateAction::new(ActionMeta::new("dup"), 3);
        let input = item(json!({"name": "a"}));
        let out = action.process(input.clone(), &context()).await.unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|copy| *copy == input));
    }

    #[tokio::test]
    async fn add_data_merges_values() {
        let mut values = Map::new();
        values.insert("target".into(), json!("/out"));
        let action = AddDataAction::new(ActionMeta::new("add"), values);
        let out = action.process(item(json!({"name": "a"})), &context()).await.unwrap();
        assert_eq!(out[0].lookup("data.target"), Some(&json!("/out")));
        assert_eq!(out[0].lookup("data.name"), Some(&json!("a")));
    }

    #[tokio::test]
    async fn regex_filter_keeps_matches() {
        let action =
            FilterByRegexAction::new(ActionMeta::new("csv"), "{{data.name}}", r"\.csv$", false)
                .unwrap();
        let ctx = context();
        assert_eq!(action.process(item(json!({"name": "a.csv"})), &ctx).await.unwrap().len(), 1);
        assert!(action.process(item(json!({"name": "a.txt"})), &ctx).await.unwrap().is_empty());
        assert!(action.process(item(json!({})), &ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn regex_filter_inverted() {
        let action =
            FilterByRegexAction::new(ActionMeta::new("no-tmp"), "{{data.name}}", "^tmp", true)
                .unwrap();
        let ctx = context();
        assert!(action.process(item(json!({"name": "tmp1"})), &ctx).await.unwrap().is_empty());
        assert_eq!(action.process(item(json!({"name": "keep"})), &ctx).await.unwrap().len(), 1);
    }

    #[test]
    fn invalid_regex_is_a_config_error() {
        let result = FilterByRegexAction::new(ActionMeta::new("bad"), "{{data.x}}", "(", false);
        assert!(matches!(result, Err(ActionError::Config(_))));
    }

    #[tokio::test]
    async fn split_array_emits_one_item_per_element() {
        let action = SplitArrayAction::new(ActionMeta::new("split"), "{{data.rows}}").unwrap();
        let input = item(json!({"source": "a.csv", "rows": [1, {"x": 2}]}));

        let out = action.process(input, &context()).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].lookup("data.rows"), Some(&json!(1)));
        assert_eq!(out[1].lookup("data.rows.x"), Some(&json!(2)));
        assert_eq!(out[1].lookup("data.source"), Some(&json!("a.csv")));
    }

    #[tokio::test]
    async fn split_array_without_array_emits_nothing() {
        let action = SplitArrayAction::new(ActionMeta::new("split"), "data.rows").unwrap();
        let ctx = context();
        assert!(action.process(item(json!({"rows": "no"})), &ctx).await.unwrap().is_empty());
        assert!(action.process(item(json!({})), &ctx).await.unwrap().is_empty());
        assert!(SplitArrayAction::new(ActionMeta::new("split"), "{{ }}").is_err());
    }

    #[tokio::test]
    async fn timestamp_filter_drops_old_items() {
        let action = FilterByTimestampAction::new(
            ActionMeta::new("recent"),
            "{{data.modified}}",
            time_span(1, "days").unwrap(),
            true,
            TimestampFormat::EpochMillis,
        );
        let ctx = context();
        let fresh = Utc::now().timestamp_millis();
        let stale = (Utc::now() - TimeDelta::try_days(3).unwrap()).timestamp_millis();

        assert_eq!(action.process(item(json!({"modified": fresh})), &ctx).await.unwrap().len(), 1);
        assert!(action.process(item(json!({"modified": stale})), &ctx).await.unwrap().is_empty());
        assert!(action.process(item(json!({})), &ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn timestamp_filter_keeps_old_items_when_inverted() {
        let action = FilterByTimestampAction::new(
            ActionMeta::new("old"),
            "{{data.day}}",
            time_span(2, "WEEKS").unwrap(),
            false,
            TimestampFormat::parse("%Y-%m-%d"),
        );
        let ctx = context();
        assert_eq!(action.process(item(json!({"day": "2001-02-03"})), &ctx).await.unwrap().len(), 1);
        let today = Utc::now().format("%Y-%m-%d").to_string();
        assert!(action.process(item(json!({"day": today})), &ctx).await.unwrap().is_empty());
        assert!(matches!(
            action.process(item(json!({"day": "yesterday"})), &ctx).await,
            Err(ActionError::Config(_))
        ));
    }

    #[test]
    fn time_span_units() {
        assert_eq!(time_span(90, "minutes"), TimeDelta::try_minutes(90));
        assert_eq!(time_span(1, "fortnights"), None);
    }

    #[tokio::test]
    async fn pause_is_skipped_in_simulation() {
        let action = PauseAction::new(ActionMeta::new("pause"), Duration::from_secs(3600));
        let out = action.process(item(json!({})), &simulation_context()).await.unwrap();
        assert_eq!(
            out[0].get(SIMULATION_LOG_KEY),
            Some(&json!("Would have paused for 3600000 milliseconds."))
        );
    }

    #[tokio::test]
    async fn pause_aborts_on_cancel() {
        let ctx = context();
        ctx.execution.cancel();
        let action = PauseAction::new(ActionMeta::new("pause"), Duration::from_secs(3600));
        let result = action.process(item(json!({})), &ctx).await;
        assert!(matches!(result, Err(ActionError::Cancelled)));
    }
}
