use reqwest::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::callback::send_callback;
use crate::core::grist::GristClient;
use crate::core::orchestrator::ScrapePipeline;
use crate::core::schemas::{CallbackPayload, Event, ParseJob, ParseMode, ScrapeOutcome};

/// Fire-and-forget background job runner.
///
/// Jobs run on freshly spawned tasks with no queue and no persistence across
/// restarts. Every job ends in exactly one callback delivery, whatever
/// happened along the way.
pub struct TaskRunner {
    pipeline: Arc<ScrapePipeline>,
    grist: Arc<GristClient>,
    client: Client,
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl TaskRunner {
    pub fn new(pipeline: Arc<ScrapePipeline>, grist: Arc<GristClient>) -> Self {
        Self {
            pipeline,
            grist,
            client: Client::new(),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn a job and return immediately. Results arrive at the job's
    /// callback URL when it finishes.
    pub fn submit(&self, job: ParseJob) {
        match job.parse_mode {
            ParseMode::Image => {
                info!("Task {} submitted for image parsing", job.request_id);
            }
            ParseMode::Hybrid => {
                info!(
                    "Task {} submitted for hybrid parsing: {}",
                    job.request_id,
                    job.url.as_deref().unwrap_or("<missing url>")
                );
            }
            ParseMode::Url => {
                info!(
                    "Task {} submitted for URL: {}",
                    job.request_id,
                    job.url.as_deref().unwrap_or("<missing url>")
                );
            }
        }

        let pipeline = Arc::clone(&self.pipeline);
        let grist = Arc::clone(&self.grist);
        let client = self.client.clone();
        let tasks = Arc::clone(&self.tasks);
        let request_id = job.request_id.clone();

        let job_future = {
            let request_id = request_id.clone();
            async move {
                run_job(pipeline, grist, client, job).await;
                if let Ok(mut tasks) = tasks.lock() {
                    tasks.remove(&request_id);
                }
            }
        };

        // Spawn while holding the map lock: the job's own removal cannot run
        // until the handle is registered, so a fast-finishing job never
        // leaves a stale entry behind.
        match self.tasks.lock() {
            Ok(mut tasks) => {
                let handle = tokio::spawn(job_future);
                tasks.insert(request_id, handle);
            }
            Err(_) => {
                tokio::spawn(job_future);
            }
        }
    }

    /// Number of jobs currently running.
    pub fn active_count(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_running(&self, request_id: &str) -> bool {
        self.tasks
            .lock()
            .map(|t| t.contains_key(request_id))
            .unwrap_or(false)
    }
}

async fn run_job(
    pipeline: Arc<ScrapePipeline>,
    grist: Arc<GristClient>,
    client: Client,
    job: ParseJob,
) {
    info!(
        "Starting parse task {} (mode={:?})",
        job.request_id, job.parse_mode
    );

    // Hybrid jobs route through the URL path; the image rides along as
    // context the page pipeline may ignore. The pipeline runs on its own
    // task so that a panic inside it still produces a delivered failure.
    let pipeline_task = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        let mode = job.parse_mode;
        let url = job.url.clone();
        let image_base64 = job.image_base64.clone();
        let wait_time = job.wait_time;
        let include_screenshot = job.include_screenshot;
        async move {
            match mode {
                ParseMode::Image => {
                    pipeline
                        .analyze_image(
                            image_base64.as_deref().unwrap_or_default(),
                            Some("Discord upload"),
                        )
                        .await
                }
                ParseMode::Url | ParseMode::Hybrid => {
                    pipeline
                        .scrape_event(
                            url.as_deref().unwrap_or_default(),
                            wait_time,
                            include_screenshot,
                        )
                        .await
                }
            }
        }
    });

    let outcome = match pipeline_task.await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("Task {} pipeline aborted: {}", job.request_id, e);
            ScrapeOutcome::failure(
                format!("Pipeline task aborted: {}", e),
                serde_json::Map::new(),
            )
        }
    };

    let mut status = "failed";
    let mut event: Option<Event> = None;
    let mut error: Option<String> = None;

    if outcome.success && outcome.event.is_some() {
        status = "completed";
        event = outcome.event;
        info!(
            "Task {} completed successfully: {}",
            job.request_id,
            event.as_ref().map(|e| e.title.as_str()).unwrap_or_default()
        );
    } else {
        error = Some(
            outcome
                .error
                .unwrap_or_else(|| "Unknown extraction error".to_string()),
        );
        warn!(
            "Task {} extraction failed: {}",
            job.request_id,
            error.as_deref().unwrap_or_default()
        );
    }

    // Persist only successes. A store failure is logged and reported through
    // the missing result_url, never by flipping the job status.
    let mut result_url = None;
    let mut record_id = None;
    if status == "completed" {
        if let Some(ref extracted) = event {
            let saved = grist.save_event(extracted).await;
            if saved.success {
                result_url = saved.record_url;
                record_id = saved.record_id;
                info!(
                    "Task {} saved to Grist: {}, record_id={}",
                    job.request_id,
                    result_url.as_deref().unwrap_or_default(),
                    record_id.unwrap_or_default()
                );
            } else {
                warn!(
                    "Task {} Grist save failed: {}",
                    job.request_id,
                    saved.error.as_deref().unwrap_or_default()
                );
            }
        }
    }

    let payload = CallbackPayload {
        request_id: job.request_id.clone(),
        origin_message_id: job.origin_message_id,
        status: status.to_string(),
        event,
        error,
        result_url,
        record_id,
    };
    send_callback(&client, &job.callback_url, &payload).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fetcher::{BrowserFetcher, PageData};
    use crate::core::grist::GristConfig;
    use crate::core::llm::EventExtractor;
    use anyhow::Result;
    use async_trait::async_trait;
    use axum::{Json, Router, extract::State, routing::post};
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    #[derive(Clone, Default)]
    struct Recorder {
        callbacks: Arc<Mutex<Vec<Value>>>,
        grist_saves: Arc<AtomicUsize>,
    }

    async fn record_callback(State(r): State<Recorder>, Json(v): Json<Value>) -> Json<Value> {
        r.callbacks.lock().unwrap().push(v);
        Json(json!({"ok": true}))
    }

    async fn record_grist_save(State(r): State<Recorder>, Json(_): Json<Value>) -> Json<Value> {
        r.grist_saves.fetch_add(1, Ordering::SeqCst);
        Json(json!({"records": [{"id": 7}]}))
    }

    async fn spawn_stub_server(recorder: Recorder) -> String {
        let app = Router::new()
            .route("/callback", post(record_callback))
            .route("/docs/{*rest}", post(record_grist_save))
            .with_state(recorder);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    struct SlowFetcher {
        delay: Duration,
    }

    #[async_trait]
    impl BrowserFetcher for SlowFetcher {
        async fn fetch(&self, _url: &str, _wait: u32, _shot: bool) -> Result<PageData> {
            sleep(self.delay).await;
            Ok(PageData {
                success: true,
                html: "<body><p>show tonight</p></body>".to_string(),
                ..Default::default()
            })
        }
    }

    struct BrokenFetcher;

    #[async_trait]
    impl BrowserFetcher for BrokenFetcher {
        async fn fetch(&self, _url: &str, _wait: u32, _shot: bool) -> Result<PageData> {
            Err(anyhow::anyhow!("connection refused"))
        }
    }

    struct StubExtractor;

    #[async_trait]
    impl EventExtractor for StubExtractor {
        async fn extract_from_page(
            &self,
            url: &str,
            _content: &str,
            _screenshot: Option<&str>,
        ) -> Event {
            Event {
                title: "Poetry Night".to_string(),
                source_url: Some(url.to_string()),
                confidence_score: Some(0.9),
                ..Default::default()
            }
        }

        async fn extract_from_image(&self, _image: &str, _desc: Option<&str>) -> Event {
            Event {
                title: "Poetry Night".to_string(),
                confidence_score: Some(0.9),
                ..Default::default()
            }
        }
    }

    fn grist_config(base: &str) -> GristConfig {
        GristConfig {
            api_base: base.to_string(),
            api_key: "test-key".to_string(),
            doc_id: "d1".to_string(),
            table: "Events".to_string(),
            ui_base: base.to_string(),
            ui_doc_id: "d1short".to_string(),
            ui_page: "Events-Page".to_string(),
        }
    }

    fn runner(fetcher: Arc<dyn BrowserFetcher>, base: &str) -> TaskRunner {
        let pipeline = Arc::new(ScrapePipeline::new(fetcher, Arc::new(StubExtractor)));
        let grist = Arc::new(GristClient::new(grist_config(base)));
        TaskRunner::new(pipeline, grist)
    }

    fn job(base: &str, mode: ParseMode, url: Option<&str>) -> ParseJob {
        ParseJob {
            request_id: "req-1".to_string(),
            callback_url: format!("{}/callback", base),
            origin_message_id: Some(42),
            parse_mode: mode,
            url: url.map(str::to_string),
            image_base64: None,
            include_screenshot: false,
            wait_time: 0,
        }
    }

    async fn wait_for_drain(runner: &TaskRunner) {
        for _ in 0..200 {
            if runner.active_count() == 0 {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("job did not finish");
    }

    #[tokio::test]
    async fn submit_returns_before_job_completes() {
        let recorder = Recorder::default();
        let base = spawn_stub_server(recorder.clone()).await;
        let runner = runner(
            Arc::new(SlowFetcher {
                delay: Duration::from_millis(200),
            }),
            &base,
        );

        runner.submit(job(&base, ParseMode::Url, Some("https://x.test/event")));
        assert_eq!(runner.active_count(), 1);
        assert!(runner.is_running("req-1"));

        wait_for_drain(&runner).await;
        assert!(!runner.is_running("req-1"));
    }

    #[tokio::test]
    async fn failed_job_delivers_once_without_store_write() {
        let recorder = Recorder::default();
        let base = spawn_stub_server(recorder.clone()).await;
        let runner = runner(Arc::new(BrokenFetcher), &base);

        runner.submit(job(&base, ParseMode::Url, Some("https://x.test/event")));
        wait_for_drain(&runner).await;

        let callbacks = recorder.callbacks.lock().unwrap();
        assert_eq!(callbacks.len(), 1);
        assert_eq!(callbacks[0]["status"], "failed");
        assert_eq!(callbacks[0]["origin_message_id"], 42);
        assert!(callbacks[0]["error"].is_string());
        assert_eq!(recorder.grist_saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn completed_job_persists_then_delivers_once() {
        let recorder = Recorder::default();
        let base = spawn_stub_server(recorder.clone()).await;
        let runner = runner(
            Arc::new(SlowFetcher {
                delay: Duration::from_millis(0),
            }),
            &base,
        );

        runner.submit(job(&base, ParseMode::Url, Some("https://x.test/event")));
        wait_for_drain(&runner).await;

        assert_eq!(recorder.grist_saves.load(Ordering::SeqCst), 1);
        let callbacks = recorder.callbacks.lock().unwrap();
        assert_eq!(callbacks.len(), 1);
        assert_eq!(callbacks[0]["status"], "completed");
        assert_eq!(callbacks[0]["record_id"], 7);
        assert_eq!(callbacks[0]["event"]["title"], "Poetry Night");
        assert!(
            callbacks[0]["result_url"]
                .as_str()
                .unwrap()
                .contains(".r7.")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fast_finishing_jobs_never_leak_map_entries() {
        // Callbacks go to a closed port so every job finishes almost
        // instantly, often before submit() has returned.
        let base = "http://127.0.0.1:9";
        let runner = runner(Arc::new(BrokenFetcher), base);

        for i in 0..200 {
            let mut queued = job(base, ParseMode::Url, Some("https://x.test/event"));
            queued.request_id = format!("req-{}", i);
            runner.submit(queued);
        }

        wait_for_drain(&runner).await;
        assert_eq!(runner.active_count(), 0);
    }

    struct PanickingFetcher;

    #[async_trait]
    impl BrowserFetcher for PanickingFetcher {
        async fn fetch(&self, _url: &str, _wait: u32, _shot: bool) -> Result<PageData> {
            panic!("fetch blew up")
        }
    }

    #[tokio::test]
    async fn panicking_pipeline_still_delivers_failure() {
        let recorder = Recorder::default();
        let base = spawn_stub_server(recorder.clone()).await;
        let runner = runner(Arc::new(PanickingFetcher), &base);

        runner.submit(job(&base, ParseMode::Url, Some("https://x.test/event")));
        wait_for_drain(&runner).await;

        let callbacks = recorder.callbacks.lock().unwrap();
        assert_eq!(callbacks.len(), 1);
        assert_eq!(callbacks[0]["status"], "failed");
        assert!(
            callbacks[0]["error"]
                .as_str()
                .unwrap()
                .contains("Pipeline task aborted")
        );
        assert_eq!(recorder.grist_saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hybrid_job_routes_through_url_pipeline() {
        let recorder = Recorder::default();
        let base = spawn_stub_server(recorder.clone()).await;
        let runner = runner(
            Arc::new(SlowFetcher {
                delay: Duration::from_millis(0),
            }),
            &base,
        );

        runner.submit(job(&base, ParseMode::Hybrid, Some("https://x.test/event")));
        wait_for_drain(&runner).await;

        let callbacks = recorder.callbacks.lock().unwrap();
        assert_eq!(callbacks.len(), 1);
        assert_eq!(callbacks[0]["status"], "completed");
        assert_eq!(
            callbacks[0]["event"]["source_url"],
            "https://x.test/event"
        );
    }
}
