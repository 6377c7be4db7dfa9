use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{read_painter_base_url, Config};
use crate::painter::client::{PainterApi, PainterError, TaskHandle, TaskResult, TaskSubmission};
use crate::painter::imaging::{self, ImageError, TempImage};
use crate::painter::poll::{PollError, PollPolicy, TaskPoller};

const TEMP_IMAGE_PREFIX: &str = "draw-";

/// The chat side of a drawing: where the source image comes from and where
/// progress and the result go.
#[async_trait]
pub trait DrawChannel: Send + Sync {
    async fn fetch_image(&self, dest: &Path) -> anyhow::Result<()>;

    /// Delivery failures are the channel's to log; the workflow carries on.
    async fn notify(&self, notice: DrawNotice);

    async fn reply_image(&self, image: Vec<u8>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct DrawSettings {
    pub painter_url_file: PathBuf,
    pub temp_dir: PathBuf,
    pub output_dir: PathBuf,
    pub mode: String,
    pub style: String,
    pub poll: PollPolicy,
}

impl DrawSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            painter_url_file: config.painter_url_file.clone(),
            temp_dir: config.temp_dir.clone(),
            output_dir: config.output_dir.clone(),
            mode: config.painter_mode.clone(),
            style: config.painter_style.clone(),
            poll: PollPolicy::from_config(config),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DrawRequest {
    pub source_image_path: PathBuf,
    pub target_service_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrawNotice {
    Disabled,
    DownloadFailed(String),
    ConversionFailed,
    Unparseable,
    Submitted(String),
    SubmissionFailed,
    Processing(String),
    Queued { task_id: String, position: String },
    Completed(String),
    PollFailed(String),
    TimedOut(String),
    Cancelled(String),
}

impl DrawNotice {
    /// Intermediate poll states, as opposed to terminal or error notices.
    pub fn is_progress(&self) -> bool {
        matches!(self, DrawNotice::Processing(_) | DrawNotice::Queued { .. })
    }
}

impl fmt::Display for DrawNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrawNotice::Disabled => {
                write!(f, "The AI drawing service is switched off. Please come back another day.")
            }
            DrawNotice::DownloadFailed(cause) => write!(
                f,
                "Failed to download the image, please try again later.\nError: {cause}"
            ),
            DrawNotice::ConversionFailed => write!(
                f,
                "Could not convert the image to PNG. Please send the original image and try again."
            ),
            DrawNotice::Unparseable => write!(
                f,
                "Cannot parse the image. Please send the original image and try again."
            ),
            DrawNotice::Submitted(task_id) => {
                write!(f, "Drawing task submitted. Task ID: {task_id}")
            }
            DrawNotice::SubmissionFailed => write!(f, "Failed to submit the drawing task."),
            DrawNotice::Processing(task_id) => write!(f, "Task ID: {task_id}\nDrawing..."),
            DrawNotice::Queued { task_id, position } => {
                write!(f, "Task ID: {task_id}\nIn queue: {position}")
            }
            DrawNotice::Completed(task_id) => {
                write!(f, "Task ID: {task_id}\nDrawing finished, sending...")
            }
            DrawNotice::PollFailed(task_id) => {
                write!(f, "Task ID: {task_id}\nFailed to fetch the result.")
            }
            DrawNotice::TimedOut(task_id) => write!(
                f,
                "Task ID: {task_id}\nThe drawing is taking too long, giving up."
            ),
            DrawNotice::Cancelled(task_id) => write!(f, "Task ID: {task_id}\nDrawing cancelled."),
        }
    }
}

#[derive(Debug, Error)]
pub enum DrawError {
    #[error("image download failed: {0}")]
    Download(String),
    #[error("image conversion failed: {0}")]
    Conversion(String),
    #[error("image is unparseable: {0}")]
    Unparseable(String),
    #[error("task submission failed: {0}")]
    Submission(String),
    #[error("polling task {task_id} failed: {source}")]
    Poll {
        task_id: String,
        #[source]
        source: PainterError,
    },
    #[error("task {task_id} timed out after {attempts} polls")]
    TimedOut { task_id: String, attempts: u32 },
    #[error("task {task_id} cancelled")]
    Cancelled { task_id: String },
}

impl DrawError {
    pub fn notice(&self) -> DrawNotice {
        match self {
            DrawError::Download(cause) => DrawNotice::DownloadFailed(cause.clone()),
            DrawError::Conversion(_) => DrawNotice::ConversionFailed,
            DrawError::Unparseable(_) => DrawNotice::Unparseable,
            DrawError::Submission(_) => DrawNotice::SubmissionFailed,
            DrawError::Poll { task_id, .. } => DrawNotice::PollFailed(task_id.clone()),
            DrawError::TimedOut { task_id, .. } => DrawNotice::TimedOut(task_id.clone()),
            DrawError::Cancelled { task_id } => DrawNotice::Cancelled(task_id.clone()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DrawError::Download(_) => "download",
            DrawError::Conversion(_) => "conversion",
            DrawError::Unparseable(_) => "unparseable",
            DrawError::Submission(_) => "submission",
            DrawError::Poll { .. } => "poll",
            DrawError::TimedOut { .. } => "timeout",
            DrawError::Cancelled { .. } => "cancelled",
        }
    }
}

impl From<ImageError> for DrawError {
    fn from(err: ImageError) -> Self {
        match err {
            ImageError::ConversionFailed(detail) => DrawError::Conversion(detail),
            other => DrawError::Unparseable(other.to_string()),
        }
    }
}

#[derive(Debug)]
pub enum DrawOutcome {
    Disabled,
    Aborted(DrawError),
    Delivered {
        task_id: String,
        saved_to: Option<PathBuf>,
    },
    /// The service finished but its payload was not base64. Logged only.
    Undeliverable {
        task_id: String,
        detail: String,
    },
}

impl DrawOutcome {
    pub fn status_label(&self) -> &'static str {
        match self {
            DrawOutcome::Disabled => "disabled",
            DrawOutcome::Aborted(err) => err.kind(),
            DrawOutcome::Delivered { .. } => "success",
            DrawOutcome::Undeliverable { .. } => "unreadable_result",
        }
    }
}

/// Runs one drawing end to end. Every failure is reported to the channel
/// exactly once and returned as `DrawOutcome::Aborted`.
pub async fn run_draw<A, C>(
    api: &A,
    channel: &C,
    settings: &DrawSettings,
    cancel: &CancellationToken,
) -> DrawOutcome
where
    A: PainterApi + ?Sized,
    C: DrawChannel + ?Sized,
{
    let base_url = match read_painter_base_url(&settings.painter_url_file) {
        Ok(Some(base_url)) => base_url,
        Ok(None) => {
            info!("Painter url not configured; drawing disabled");
            channel.notify(DrawNotice::Disabled).await;
            return DrawOutcome::Disabled;
        }
        Err(err) => {
            warn!("Painter url unusable, treating drawing as disabled: {err}");
            channel.notify(DrawNotice::Disabled).await;
            return DrawOutcome::Disabled;
        }
    };

    match execute(api, channel, settings, &base_url, cancel).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(kind = err.kind(), "Drawing aborted: {err}");
            channel.notify(err.notice()).await;
            DrawOutcome::Aborted(err)
        }
    }
}

async fn execute<A, C>(
    api: &A,
    channel: &C,
    settings: &DrawSettings,
    base_url: &str,
    cancel: &CancellationToken,
) -> Result<DrawOutcome, DrawError>
where
    A: PainterApi + ?Sized,
    C: DrawChannel + ?Sized,
{
    let temp = TempImage::create_in(&settings.temp_dir, TEMP_IMAGE_PREFIX)
        .map_err(|err| DrawError::Download(format!("cannot create temp file: {err}")))?;

    channel
        .fetch_image(temp.path())
        .await
        .map_err(|err| DrawError::Download(err.to_string()))?;

    let request = DrawRequest {
        source_image_path: temp.path().to_path_buf(),
        target_service_url: base_url.to_string(),
    };

    prepare_source(&request.source_image_path).await?;
    let task = submit_task(api, &request, settings).await?;
    channel
        .notify(DrawNotice::Submitted(task.task_id.clone()))
        .await;

    // The source file is not needed while the service works.
    drop(temp);

    let base64_image = await_result(api, channel, &request, &task, settings.poll, cancel).await?;
    deliver(channel, &task, &base64_image, &settings.output_dir).await
}

async fn prepare_source(path: &Path) -> Result<(), DrawError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<(), ImageError> {
        imaging::normalize_image(&path)?;
        imaging::validate_image(&path)?;
        Ok(())
    })
    .await
    .map_err(|err| DrawError::Conversion(format!("normalization task failed: {err}")))??;
    Ok(())
}

async fn submit_task<A>(
    api: &A,
    request: &DrawRequest,
    settings: &DrawSettings,
) -> Result<TaskHandle, DrawError>
where
    A: PainterApi + ?Sized,
{
    let path = request.source_image_path.clone();
    let encoded = tokio::task::spawn_blocking(move || imaging::encode_image(&path))
        .await
        .map_err(|err| DrawError::Submission(format!("encoding task failed: {err}")))?
        .map_err(|err| DrawError::Submission(err.to_string()))?;

    let submission = TaskSubmission {
        mode: settings.mode.clone(),
        style: settings.style.clone(),
        encoded_image: encoded.base64,
        width: encoded.dimensions.width,
        height: encoded.dimensions.height,
    };

    api.insert_task(&request.target_service_url, &submission)
        .await
        .map_err(|err| DrawError::Submission(err.to_string()))
}

async fn await_result<A, C>(
    api: &A,
    channel: &C,
    request: &DrawRequest,
    task: &TaskHandle,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> Result<String, DrawError>
where
    A: PainterApi + ?Sized,
    C: DrawChannel + ?Sized,
{
    let mut poller = TaskPoller::new(api, &request.target_service_url, task, policy, cancel);
    loop {
        let status = poller.next_status().await.map_err(|err| match err {
            PollError::Service(source) => DrawError::Poll {
                task_id: task.task_id.clone(),
                source,
            },
            PollError::TimedOut { attempts } => DrawError::TimedOut {
                task_id: task.task_id.clone(),
                attempts,
            },
            PollError::Cancelled { .. } => DrawError::Cancelled {
                task_id: task.task_id.clone(),
            },
        })?;

        match status {
            TaskResult::Processing => {
                channel
                    .notify(DrawNotice::Processing(task.task_id.clone()))
                    .await;
            }
            TaskResult::Queued { position } => {
                channel
                    .notify(DrawNotice::Queued {
                        task_id: task.task_id.clone(),
                        position,
                    })
                    .await;
            }
            TaskResult::Completed { base64_image } => {
                info!(
                    task_id = %task.task_id,
                    polls = poller.attempts(),
                    "Painter task completed"
                );
                return Ok(base64_image);
            }
        }
    }
}

async fn deliver<C>(
    channel: &C,
    task: &TaskHandle,
    base64_image: &str,
    output_dir: &Path,
) -> Result<DrawOutcome, DrawError>
where
    C: DrawChannel + ?Sized,
{
    channel
        .notify(DrawNotice::Completed(task.task_id.clone()))
        .await;

    let bytes = match imaging::decode_base64(base64_image) {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(task_id = %task.task_id, "Drawing result is not base64: {err}");
            return Ok(DrawOutcome::Undeliverable {
                task_id: task.task_id.clone(),
                detail: err.to_string(),
            });
        }
    };

    // The chat reply and the local copy are independent of each other.
    if let Err(err) = channel.reply_image(bytes.clone()).await {
        error!(task_id = %task.task_id, "Failed to send drawing result: {err}");
    }

    let task_id = task.task_id.clone();
    let output_dir = output_dir.to_path_buf();
    let saved = tokio::task::spawn_blocking(move || imaging::save_png(&bytes, &output_dir, &task_id))
        .await;
    let saved_to = match saved {
        Ok(Ok(path)) => {
            info!(task_id = %task.task_id, path = %path.display(), "Saved drawing result");
            Some(path)
        }
        Ok(Err(err)) => {
            warn!(task_id = %task.task_id, "Failed to save drawing result: {err}");
            None
        }
        Err(err) => {
            warn!(task_id = %task.task_id, "Save task failed: {err}");
            None
        }
    };

    Ok(DrawOutcome::Delivered {
        task_id: task.task_id.clone(),
        saved_to,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::fs;
    use std::io::Cursor;
    use std::time::Duration;

    use base64::{engine::general_purpose, Engine as _};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use parking_lot::Mutex;
    use tempfile::TempDir;

    use super::*;

    struct FakePainter {
        insert_response: Mutex<Option<Result<TaskHandle, PainterError>>>,
        results: Mutex<VecDeque<Result<TaskResult, PainterError>>>,
        submissions: Mutex<Vec<TaskSubmission>>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl FakePainter {
        fn new(
            insert_response: Result<TaskHandle, PainterError>,
            results: Vec<Result<TaskResult, PainterError>>,
        ) -> Self {
            Self {
                insert_response: Mutex::new(Some(insert_response)),
                results: Mutex::new(results.into()),
                submissions: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn accepting(results: Vec<TaskResult>) -> Self {
            Self::new(
                Ok(TaskHandle {
                    task_id: "task-7".to_string(),
                }),
                results.into_iter().map(Ok).collect(),
            )
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl PainterApi for FakePainter {
        async fn insert_task(
            &self,
            _base_url: &str,
            submission: &TaskSubmission,
        ) -> Result<TaskHandle, PainterError> {
            self.calls.lock().push("insert_task");
            self.submissions.lock().push(submission.clone());
            self.insert_response
                .lock()
                .take()
                .expect("insert_task called once")
        }

        async fn get_task_result(
            &self,
            _base_url: &str,
            _task: &TaskHandle,
        ) -> Result<TaskResult, PainterError> {
            self.calls.lock().push("get_task_result");
            self.results
                .lock()
                .pop_front()
                .unwrap_or(Ok(TaskResult::Processing))
        }
    }

    struct FakeChannel {
        source: Option<Vec<u8>>,
        fetched_into: Mutex<Option<PathBuf>>,
        notices: Mutex<Vec<DrawNotice>>,
        images: Mutex<Vec<Vec<u8>>>,
        cancel_after_progress: Option<(usize, CancellationToken)>,
    }

    impl FakeChannel {
        fn with_source(bytes: Vec<u8>) -> Self {
            Self {
                source: Some(bytes),
                fetched_into: Mutex::new(None),
                notices: Mutex::new(Vec::new()),
                images: Mutex::new(Vec::new()),
                cancel_after_progress: None,
            }
        }

        fn failing_download() -> Self {
            Self {
                source: None,
                ..Self::with_source(Vec::new())
            }
        }

        fn notices(&self) -> Vec<DrawNotice> {
            self.notices.lock().clone()
        }
    }

    #[async_trait]
    impl DrawChannel for FakeChannel {
        async fn fetch_image(&self, dest: &Path) -> anyhow::Result<()> {
            *self.fetched_into.lock() = Some(dest.to_path_buf());
            match &self.source {
                Some(bytes) => {
                    fs::write(dest, bytes)?;
                    Ok(())
                }
                None => Err(anyhow::anyhow!("file is too big")),
            }
        }

        async fn notify(&self, notice: DrawNotice) {
            let mut notices = self.notices.lock();
            notices.push(notice);
            if let Some((limit, token)) = &self.cancel_after_progress {
                if notices.iter().filter(|n| n.is_progress()).count() >= *limit {
                    token.cancel();
                }
            }
        }

        async fn reply_image(&self, image: Vec<u8>) -> anyhow::Result<()> {
            self.images.lock().push(image);
            Ok(())
        }
    }

    struct Fixture {
        dir: TempDir,
        settings: DrawSettings,
    }

    impl Fixture {
        fn new(url_file_contents: Option<&str>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let url_file = dir.path().join("sd_painter_url");
            if let Some(contents) = url_file_contents {
                fs::write(&url_file, contents).unwrap();
            }
            let settings = DrawSettings {
                painter_url_file: url_file,
                temp_dir: dir.path().join("tmp"),
                output_dir: dir.path().join("outputs"),
                mode: "repaint".to_string(),
                style: "anime".to_string(),
                poll: PollPolicy {
                    interval: Duration::from_secs(10),
                    backoff_factor: 1.0,
                    max_interval: Duration::from_secs(10),
                    timeout: None,
                },
            };
            Self { dir, settings }
        }

        fn enabled() -> Self {
            Self::new(Some("http://painter.local:7860\n"))
        }

        fn temp_dir_is_empty(&self) -> bool {
            match fs::read_dir(&self.settings.temp_dir) {
                Ok(mut entries) => entries.next().is_none(),
                Err(_) => true,
            }
        }
    }

    fn encode(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, format).unwrap();
        buffer.into_inner()
    }

    fn sample_jpeg() -> Vec<u8> {
        let image = RgbImage::from_fn(24, 16, |x, y| Rgb([x as u8 * 10, y as u8 * 15, 90]));
        encode(&DynamicImage::ImageRgb8(image), ImageFormat::Jpeg)
    }

    fn result_png_base64() -> String {
        let image = RgbImage::from_fn(4, 4, |x, _| Rgb([x as u8 * 60, 0, 0]));
        general_purpose::STANDARD.encode(encode(&DynamicImage::ImageRgb8(image), ImageFormat::Png))
    }

    #[tokio::test(start_paused = true)]
    async fn canned_poll_sequence_notifies_in_order_then_completes() {
        let fixture = Fixture::enabled();
        let result = result_png_base64();
        let api = FakePainter::accepting(vec![
            TaskResult::from_service_string("processing".to_string()),
            TaskResult::from_service_string("in queue 3".to_string()),
            TaskResult::from_service_string("in queue 1".to_string()),
            TaskResult::from_service_string(result.clone()),
        ]);
        let channel = FakeChannel::with_source(sample_jpeg());
        let cancel = CancellationToken::new();

        let outcome = run_draw(&api, &channel, &fixture.settings, &cancel).await;

        let saved_to = match outcome {
            DrawOutcome::Delivered { task_id, saved_to } => {
                assert_eq!(task_id, "task-7");
                saved_to
            }
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(
            channel.notices(),
            vec![
                DrawNotice::Submitted("task-7".to_string()),
                DrawNotice::Processing("task-7".to_string()),
                DrawNotice::Queued {
                    task_id: "task-7".to_string(),
                    position: "3".to_string()
                },
                DrawNotice::Queued {
                    task_id: "task-7".to_string(),
                    position: "1".to_string()
                },
                DrawNotice::Completed("task-7".to_string()),
            ]
        );
        assert_eq!(
            channel.notices().iter().filter(|n| n.is_progress()).count(),
            3
        );

        let sent = channel.images.lock().clone();
        assert_eq!(sent, vec![general_purpose::STANDARD.decode(&result).unwrap()]);
        assert_eq!(
            saved_to,
            Some(fixture.dir.path().join("outputs").join("task-7.png"))
        );
        assert!(fixture.temp_dir_is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn submission_is_normalized_png_with_dimensions() {
        let fixture = Fixture::enabled();
        let api = FakePainter::accepting(vec![TaskResult::Completed {
            base64_image: result_png_base64(),
        }]);
        let channel = FakeChannel::with_source(sample_jpeg());

        run_draw(&api, &channel, &fixture.settings, &CancellationToken::new()).await;

        let submissions = api.submissions.lock().clone();
        assert_eq!(submissions.len(), 1);
        let submission = &submissions[0];
        assert_eq!(submission.mode, "repaint");
        assert_eq!(submission.style, "anime");
        assert_eq!((submission.width, submission.height), (24, 16));

        let bytes = general_purpose::STANDARD
            .decode(&submission.encoded_image)
            .unwrap();
        assert_eq!(imaging::detect_format(&bytes), Some(ImageFormat::Png));
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.color(), image::ColorType::Rgba8);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_task_id_aborts_before_polling() {
        let fixture = Fixture::enabled();
        let api = FakePainter::new(
            Err(PainterError::MissingField {
                endpoint: "http://painter.local:7860/insert_task".to_string(),
                field: "task_id",
            }),
            Vec::new(),
        );
        let channel = FakeChannel::with_source(sample_jpeg());

        let outcome = run_draw(&api, &channel, &fixture.settings, &CancellationToken::new()).await;

        assert!(matches!(
            outcome,
            DrawOutcome::Aborted(DrawError::Submission(_))
        ));
        assert_eq!(api.calls(), vec!["insert_task"]);
        assert_eq!(channel.notices(), vec![DrawNotice::SubmissionFailed]);
        assert!(fixture.temp_dir_is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unparseable_image_makes_no_network_call() {
        let fixture = Fixture::enabled();
        let api = FakePainter::accepting(Vec::new());
        let channel = FakeChannel::with_source(b"GIF89a but not really".to_vec());

        let outcome = run_draw(&api, &channel, &fixture.settings, &CancellationToken::new()).await;

        assert!(matches!(
            outcome,
            DrawOutcome::Aborted(DrawError::Unparseable(_))
        ));
        assert!(api.calls().is_empty());
        assert_eq!(channel.notices(), vec![DrawNotice::Unparseable]);
        assert!(DrawNotice::Unparseable
            .to_string()
            .starts_with("Cannot parse the image"));
        assert!(fixture.temp_dir_is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_config_skips_download_and_network() {
        for contents in [None, Some(""), Some("\n")] {
            let fixture = Fixture::new(contents);
            let api = FakePainter::accepting(Vec::new());
            let channel = FakeChannel::with_source(sample_jpeg());

            let outcome =
                run_draw(&api, &channel, &fixture.settings, &CancellationToken::new()).await;

            assert!(matches!(outcome, DrawOutcome::Disabled));
            assert_eq!(channel.notices(), vec![DrawNotice::Disabled]);
            assert!(channel.fetched_into.lock().is_none());
            assert!(api.calls().is_empty());
            assert!(!fixture.settings.temp_dir.exists());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn download_failure_echoes_cause() {
        let fixture = Fixture::enabled();
        let api = FakePainter::accepting(Vec::new());
        let channel = FakeChannel::failing_download();

        let outcome = run_draw(&api, &channel, &fixture.settings, &CancellationToken::new()).await;

        assert!(matches!(outcome, DrawOutcome::Aborted(DrawError::Download(_))));
        assert_eq!(
            channel.notices(),
            vec![DrawNotice::DownloadFailed("file is too big".to_string())]
        );
        assert!(api.calls().is_empty());
        assert!(fixture.temp_dir_is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_failure_is_fatal_without_retry() {
        let fixture = Fixture::enabled();
        let api = FakePainter::new(
            Ok(TaskHandle {
                task_id: "task-9".to_string(),
            }),
            vec![
                Ok(TaskResult::Processing),
                Err(PainterError::Decode {
                    endpoint: "http://painter.local:7860/get_task_result".to_string(),
                    detail: "expected value".to_string(),
                }),
                Ok(TaskResult::Processing),
            ],
        );
        let channel = FakeChannel::with_source(sample_jpeg());

        let outcome = run_draw(&api, &channel, &fixture.settings, &CancellationToken::new()).await;

        assert!(matches!(
            outcome,
            DrawOutcome::Aborted(DrawError::Poll { .. })
        ));
        assert_eq!(
            api.calls(),
            vec!["insert_task", "get_task_result", "get_task_result"]
        );
        assert_eq!(
            channel.notices().last(),
            Some(&DrawNotice::PollFailed("task-9".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_polling() {
        let fixture = Fixture::enabled();
        let api = FakePainter::accepting(Vec::new());
        let cancel = CancellationToken::new();
        let channel = FakeChannel {
            cancel_after_progress: Some((2, cancel.clone())),
            ..FakeChannel::with_source(sample_jpeg())
        };

        let outcome = run_draw(&api, &channel, &fixture.settings, &cancel).await;

        assert!(matches!(
            outcome,
            DrawOutcome::Aborted(DrawError::Cancelled { .. })
        ));
        assert_eq!(
            channel.notices().last(),
            Some(&DrawNotice::Cancelled("task-7".to_string()))
        );
        assert_eq!(
            api.calls(),
            vec!["insert_task", "get_task_result", "get_task_result"]
        );
        assert!(channel.images.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_result_is_replied_but_not_saved() {
        let fixture = Fixture::enabled();
        let garbage = general_purpose::STANDARD.encode(b"not an image at all");
        let api = FakePainter::accepting(vec![TaskResult::Completed {
            base64_image: garbage,
        }]);
        let channel = FakeChannel::with_source(sample_jpeg());

        let outcome = run_draw(&api, &channel, &fixture.settings, &CancellationToken::new()).await;

        assert!(matches!(
            outcome,
            DrawOutcome::Delivered { saved_to: None, .. }
        ));
        assert_eq!(channel.images.lock().len(), 1);
        assert_eq!(
            channel.notices().last(),
            Some(&DrawNotice::Completed("task-7".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_base64_result_is_logged_without_a_chat_message() {
        let fixture = Fixture::enabled();
        let api = FakePainter::accepting(vec![TaskResult::Completed {
            base64_image: "error: CUDA out of memory".to_string(),
        }]);
        let channel = FakeChannel::with_source(sample_jpeg());

        let outcome = run_draw(&api, &channel, &fixture.settings, &CancellationToken::new()).await;

        assert!(matches!(
            outcome,
            DrawOutcome::Undeliverable { ref task_id, .. } if task_id == "task-7"
        ));
        assert_eq!(outcome.status_label(), "unreadable_result");
        assert!(channel.images.lock().is_empty());
        assert_eq!(
            channel.notices(),
            vec![
                DrawNotice::Submitted("task-7".to_string()),
                DrawNotice::Completed("task-7".to_string()),
            ]
        );
        assert!(!fixture.settings.output_dir.join("task-7.png").exists());
    }
}
