//! Generation telemetry recording.
//!
//! One event per submission, completion and cancellation goes into the
//! generation stream of the Event Buffer; the analytics transfer drains them
//! into the durable table. Values are stringified flat fields, empty string
//! standing in for null.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;

use renderflow_db::Job;
use renderflow_events::EventBuffer;
use renderflow_protocol::naming::generation_events_stream;
use renderflow_protocol::GenerationEventKind;

pub struct GenerationEventRecorder {
    buffer: Arc<EventBuffer>,
    topic: String,
}

impl GenerationEventRecorder {
    pub fn new(buffer: Arc<EventBuffer>, namespace: &str) -> Self {
        Self {
            buffer,
            topic: generation_events_stream(namespace),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Record a submission.
    pub fn record_request(&self, job: &Job) {
        let mut fields = self.base_fields(job, GenerationEventKind::Request);
        fields.insert("prompt_tokens".into(), rough_token_count(&job.prompt).to_string());
        self.buffer.append(&self.topic, fields);
    }

    /// Record a completion (successful or failed).
    #[allow(clippy::too_many_arguments)]
    pub fn record_completion(
        &self,
        job: &Job,
        success: bool,
        duration_ms: Option<i64>,
        error_type: Option<&str>,
        error_message: Option<&str>,
        queue_wait_ms: Option<i64>,
        generation_ms: Option<i64>,
    ) {
        let mut fields = self.base_fields(job, GenerationEventKind::Completion);
        fields.insert("success".into(), success.to_string());
        fields.insert("duration_ms".into(), opt_string(duration_ms));
        fields.insert("error_type".into(), error_type.unwrap_or("").to_string());
        fields.insert("error_message".into(), error_message.unwrap_or("").to_string());
        fields.insert("queue_wait_time_ms".into(), opt_string(queue_wait_ms));
        fields.insert("generation_time_ms".into(), opt_string(generation_ms));
        self.buffer.append(&self.topic, fields);
    }

    /// Record an explicit cancellation.
    pub fn record_cancellation(&self, job: &Job) {
        let fields = self.base_fields(job, GenerationEventKind::Cancellation);
        self.buffer.append(&self.topic, fields);
    }

    fn base_fields(&self, job: &Job, kind: GenerationEventKind) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("event_type".into(), kind.as_str().to_string());
        fields.insert("generation_id".into(), job.id.to_string());
        fields.insert("user_id".into(), job.user_id.clone());
        fields.insert("timestamp".into(), Utc::now().to_rfc3339());
        fields.insert("generation_type".into(), job.job_type.as_str().to_string());
        fields.insert(
            "model_checkpoint".into(),
            job.checkpoint_model.clone().unwrap_or_default(),
        );
        fields.insert("image_dimensions".into(), dimensions(job));
        fields.insert(
            "batch_size".into(),
            job.batch_size.map(|b| b.to_string()).unwrap_or_default(),
        );
        fields
    }
}

fn dimensions(job: &Job) -> String {
    match (job.width, job.height) {
        (Some(width), Some(height)) => format!("{width}x{height}"),
        _ => String::new(),
    }
}

fn opt_string(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Whitespace-split approximation, good enough for capacity trends.
fn rough_token_count(prompt: &str) -> usize {
    prompt.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderflow_events::StreamId;

    fn job() -> Job {
        use renderflow_protocol::{BackendKind, JobKind, JobStatus, SamplerParams};
        use sqlx::types::Json;
        Job {
            id: 7,
            user_id: "2a7f3c94-0000-0000-0000-000000000000".into(),
            job_type: JobKind::Image,
            status: JobStatus::Pending,
            prompt: "sunrise over quiet mountains".into(),
            negative_prompt: None,
            checkpoint_model: Some("illustriousXL_v01.safetensors".into()),
            lora_models: Json(vec![]),
            width: Some(832),
            height: Some(1216),
            batch_size: Some(2),
            sampler_params: Json(SamplerParams::default()),
            params: Json(Default::default()),
            backend: BackendKind::Mock,
            backend_correlation_id: None,
            dispatch_token: None,
            error_message: None,
            content_id: None,
            created_at: Utc::now(),
            started_at: None,
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn request_event_carries_job_shape() {
        let buffer = Arc::new(EventBuffer::new());
        let recorder = GenerationEventRecorder::new(buffer.clone(), "renderflow_test");
        recorder.record_request(&job());

        let entries = buffer.range(recorder.topic(), StreamId::ZERO, 10);
        assert_eq!(entries.len(), 1);
        let fields = &entries[0].fields;
        assert_eq!(fields["event_type"], "request");
        assert_eq!(fields["generation_id"], "7");
        assert_eq!(fields["image_dimensions"], "832x1216");
        assert_eq!(fields["batch_size"], "2");
        assert_eq!(fields["prompt_tokens"], "4");
    }

    #[test]
    fn completion_event_stringifies_optionals() {
        let buffer = Arc::new(EventBuffer::new());
        let recorder = GenerationEventRecorder::new(buffer.clone(), "renderflow_test");
        recorder.record_completion(&job(), true, Some(4500), None, None, Some(120), Some(4380));
        recorder.record_completion(&job(), false, None, Some("backend_error"), Some("GPU OOM"), None, None);

        let entries = buffer.range(recorder.topic(), StreamId::ZERO, 10);
        assert_eq!(entries[0].fields["success"], "true");
        assert_eq!(entries[0].fields["duration_ms"], "4500");
        assert_eq!(entries[1].fields["success"], "false");
        assert_eq!(entries[1].fields["duration_ms"], "");
        assert_eq!(entries[1].fields["error_message"], "GPU OOM");
    }
}
