//! Segmenter implementations: real FFmpeg and a test double.
//!
//! A segmenter run owns one child process (or pretends to), streams
//! [`PackagerEvent`]s to its supervisor, and honours a cancel signal by
//! terminating the child. FFmpeg progress arrives on stdout via
//! `-progress pipe:1` as key=value blocks; stderr is collected for error
//! classification.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::{ConversionMode, PackagerError, PackagerEvent, classify_failure};
use crate::config::PackagerConfig;

/// One packaging run: input file, HLS output directory, stream treatment.
#[derive(Debug, Clone)]
pub struct SegmentSpec {
    /// The (possibly partial) video file on disk
    pub input: PathBuf,
    /// Directory receiving `playlist.m3u8` and `segment%03d.ts`
    pub output_dir: PathBuf,
    /// Stream copy or re-encode
    pub mode: ConversionMode,
}

/// A packaging backend the supervisor can drive.
#[async_trait]
pub trait Segmenter: Send + Sync {
    /// Runs one packaging attempt to completion, emitting events along the
    /// way. Returns `Ok(())` on success or when cancelled via `cancel`.
    ///
    /// # Errors
    ///
    /// - `PackagerError::FileNotReady` - FFmpeg could not open the partial input
    /// - `PackagerError::Codec` - codec or container rejection
    /// - `PackagerError::Fatal` - any other failure
    async fn run(
        &self,
        spec: SegmentSpec,
        events: mpsc::Sender<PackagerEvent>,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), PackagerError>;
}

/// Production segmenter supervising the FFmpeg binary.
pub struct FfmpegSegmenter {
    config: PackagerConfig,
}

impl FfmpegSegmenter {
    /// Creates a segmenter with the given FFmpeg configuration.
    pub fn new(config: PackagerConfig) -> Self {
        Self { config }
    }

    /// Estimates the input duration in seconds via ffprobe. `None` when
    /// the probe fails or reports nothing useful, which happens routinely
    /// on partial files; progress then falls back to frame counting.
    async fn probe_duration(&self, input: &Path) -> Option<f64> {
        let output = tokio::process::Command::new(&self.config.ffprobe_path)
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(input)
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            debug!("ffprobe failed on {}", input.display());
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|d| *d > 0.0)
    }
}

/// FFmpeg argv for one run.
pub fn build_ffmpeg_args(spec: &SegmentSpec, config: &PackagerConfig) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-nostats".into(),
        "-progress".into(),
        "pipe:1".into(),
        "-y".into(),
        // Generate PTS for inputs with missing timestamps
        "-fflags".into(),
        "+genpts".into(),
        "-i".into(),
        spec.input.to_string_lossy().into_owned(),
    ];

    match spec.mode {
        ConversionMode::StreamCopy => {
            args.push("-c".into());
            args.push("copy".into());
        }
        ConversionMode::ReEncode => {
            args.extend([
                "-c:v".into(),
                "libx264".into(),
                "-preset".into(),
                config.reencode_preset.clone(),
                "-crf".into(),
                config.reencode_crf.to_string(),
                "-c:a".into(),
                "aac".into(),
            ]);
        }
    }

    let is_mp4_input = spec
        .input
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("mp4") || e.eq_ignore_ascii_case("m4v"))
        .unwrap_or(false);
    if is_mp4_input {
        args.push("-movflags".into());
        args.push("+faststart".into());
    }

    args.extend([
        "-avoid_negative_ts".into(),
        "make_zero".into(),
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        config.segment_seconds.to_string(),
        "-hls_list_size".into(),
        config.playlist_window.to_string(),
        "-hls_flags".into(),
        "delete_segments+append_list".into(),
        "-hls_segment_filename".into(),
        spec.output_dir
            .join("segment%03d.ts")
            .to_string_lossy()
            .into_owned(),
        spec.output_dir
            .join("playlist.m3u8")
            .to_string_lossy()
            .into_owned(),
    ]);

    args
}

#[async_trait]
impl Segmenter for FfmpegSegmenter {
    async fn run(
        &self,
        spec: SegmentSpec,
        events: mpsc::Sender<PackagerEvent>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), PackagerError> {
        let duration = self.probe_duration(&spec.input).await;
        let args = build_ffmpeg_args(&spec, &self.config);
        debug!("Spawning ffmpeg {}", args.join(" "));

        let mut child = tokio::process::Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PackagerError::Fatal {
                reason: format!("failed to spawn ffmpeg: {e}"),
            })?;

        let _ = events.send(PackagerEvent::Started).await;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill().await;
            return Err(PackagerError::Fatal {
                reason: "ffmpeg stdout pipe unavailable".to_string(),
            });
        };
        let Some(mut stderr) = child.stderr.take() else {
            let _ = child.kill().await;
            return Err(PackagerError::Fatal {
                reason: "ffmpeg stderr pipe unavailable".to_string(),
            });
        };
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut frames = 0u64;
        let mut out_time_us: Option<u64> = None;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            let Some((key, value)) = line.split_once('=') else {
                                continue;
                            };
                            match key.trim() {
                                "frame" => frames = value.trim().parse().unwrap_or(frames),
                                // out_time_ms is microseconds despite the name
                                "out_time_us" | "out_time_ms" => {
                                    out_time_us = value.trim().parse().ok();
                                }
                                "progress" => {
                                    let percent = match (duration, out_time_us) {
                                        (Some(total), Some(us)) if total > 0.0 => {
                                            Some((us as f64 / 1_000_000.0 / total * 100.0)
                                                .clamp(0.0, 100.0))
                                        }
                                        _ => None,
                                    };
                                    let _ = events
                                        .send(PackagerEvent::Progress { percent, frames })
                                        .await;
                                }
                                _ => {}
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("ffmpeg progress pipe error: {}", e);
                            break;
                        }
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        terminate_child(&mut child).await;
                        return Ok(());
                    }
                }
            }
        }

        drop(child.stdin.take());
        let status = child.wait().await?;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if status.success() {
            let _ = events.send(PackagerEvent::Completed).await;
            Ok(())
        } else {
            debug!("ffmpeg exited {}: {}", status, stderr_text.trim());
            Err(classify_failure(&stderr_text))
        }
    }
}

/// How long FFmpeg gets to flush the last segment after a stop request.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Terminates the child with SIGTERM, escalating through FFmpeg's stdin
/// quit command to a hard kill when it keeps running past the grace
/// period.
async fn terminate_child(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid names a child this process spawned and still owns
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_ok() {
            debug!("ffmpeg exited on SIGTERM");
            return;
        }
        warn!("ffmpeg ignored SIGTERM");
    }

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(b"q\n").await;
        let _ = stdin.flush().await;
    }

    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(_) => debug!("ffmpeg exited on quit request"),
        Err(_) => {
            warn!("ffmpeg ignored quit request, killing");
            let _ = child.kill().await;
        }
    }
}

/// Test segmenter: writes a real playlist and TS segments, emits a scripted
/// progress ramp, and can fail the first N runs with configured errors.
pub struct SimSegmenter {
    segment_count: u32,
    step: Duration,
    percents: Vec<f64>,
    with_duration: bool,
    fail_plan: std::sync::Mutex<std::collections::VecDeque<PackagerError>>,
}

impl SimSegmenter {
    /// A segmenter that succeeds immediately with three segments.
    pub fn new() -> Self {
        Self {
            segment_count: 3,
            step: Duration::from_millis(10),
            percents: vec![4.0, 12.0, 55.0, 100.0],
            with_duration: true,
            fail_plan: std::sync::Mutex::new(std::collections::VecDeque::new()),
        }
    }

    /// Queue an error to be returned (in order) before runs succeed.
    pub fn failing_with(self, error: PackagerError) -> Self {
        self.fail_plan
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
        self
    }

    /// Report progress without percentages, as for unknown durations.
    pub fn without_duration(mut self) -> Self {
        self.with_duration = false;
        self
    }

    fn write_output(&self, output_dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(output_dir)?;

        let mut playlist = String::from(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:0\n",
        );
        for index in 0..self.segment_count {
            playlist.push_str(&format!("#EXTINF:10.0,\nsegment{index:03}.ts\n"));

            // Ten sync-aligned TS packets per segment
            let mut segment = Vec::with_capacity(188 * 10);
            for _ in 0..10 {
                segment.push(0x47);
                segment.extend(std::iter::repeat_n(0x11u8, 187));
            }
            std::fs::write(output_dir.join(format!("segment{index:03}.ts")), segment)?;
        }
        playlist.push_str("#EXT-X-ENDLIST\n");
        std::fs::write(output_dir.join("playlist.m3u8"), playlist)
    }
}

impl Default for SimSegmenter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Segmenter for SimSegmenter {
    async fn run(
        &self,
        spec: SegmentSpec,
        events: mpsc::Sender<PackagerEvent>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), PackagerError> {
        let scripted = self
            .fail_plan
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }

        let _ = events.send(PackagerEvent::Started).await;
        self.write_output(&spec.output_dir)?;

        for (step, percent) in self.percents.iter().enumerate() {
            tokio::time::sleep(self.step).await;
            if *cancel.borrow_and_update() {
                return Ok(());
            }
            let _ = events
                .send(PackagerEvent::Progress {
                    percent: self.with_duration.then_some(*percent),
                    frames: (step as u64 + 1) * 250,
                })
                .await;
        }

        let _ = events.send(PackagerEvent::Completed).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(mode: ConversionMode) -> SegmentSpec {
        SegmentSpec {
            input: PathBuf::from("/tmp/in/movie.mp4"),
            output_dir: PathBuf::from("/tmp/out"),
            mode,
        }
    }

    #[test]
    fn test_stream_copy_args() {
        let config = PackagerConfig::default();
        let args = build_ffmpeg_args(&spec(ConversionMode::StreamCopy), &config);

        let joined = args.join(" ");
        assert!(joined.contains("-c copy"));
        assert!(joined.contains("-f hls"));
        assert!(joined.contains("-hls_time 10"));
        assert!(joined.contains("-hls_list_size 6"));
        assert!(joined.contains("-hls_flags delete_segments+append_list"));
        assert!(joined.contains("-fflags +genpts"));
        assert!(joined.contains("-avoid_negative_ts make_zero"));
        assert!(joined.contains("segment%03d.ts"));
        assert!(joined.ends_with("playlist.m3u8"));
    }

    #[test]
    fn test_faststart_only_for_mp4_input() {
        let config = PackagerConfig::default();

        let mp4 = build_ffmpeg_args(&spec(ConversionMode::StreamCopy), &config).join(" ");
        assert!(mp4.contains("-movflags +faststart"));

        let mut mkv_spec = spec(ConversionMode::StreamCopy);
        mkv_spec.input = PathBuf::from("/tmp/in/movie.mkv");
        let mkv = build_ffmpeg_args(&mkv_spec, &config).join(" ");
        assert!(!mkv.contains("faststart"));
    }

    #[test]
    fn test_reencode_args() {
        let config = PackagerConfig::default();
        let args = build_ffmpeg_args(&spec(ConversionMode::ReEncode), &config).join(" ");

        assert!(args.contains("-c:v libx264"));
        assert!(args.contains("-preset ultrafast"));
        assert!(args.contains("-crf 28"));
        assert!(args.contains("-c:a aac"));
        assert!(!args.contains("-c copy"));
    }

    #[tokio::test]
    async fn test_sim_segmenter_writes_playable_output() {
        let temp = tempfile::tempdir().unwrap();
        let segmenter = SimSegmenter::new();
        let (tx, mut rx) = mpsc::channel(32);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let run_spec = SegmentSpec {
            input: temp.path().join("in.mp4"),
            output_dir: temp.path().join("hls"),
            mode: ConversionMode::StreamCopy,
        };
        segmenter.run(run_spec, tx, cancel_rx).await.unwrap();

        let playlist = std::fs::read_to_string(temp.path().join("hls/playlist.m3u8")).unwrap();
        assert!(playlist.starts_with("#EXTM3U"));

        let segment = std::fs::read(temp.path().join("hls/segment000.ts")).unwrap();
        assert_eq!(segment[0], 0x47);
        assert_eq!(segment.len() % 188, 0);

        let mut saw_completed = false;
        while let Some(event) = rx.recv().await {
            if matches!(event, PackagerEvent::Completed) {
                saw_completed = true;
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn test_sim_segmenter_scripted_failure() {
        let temp = tempfile::tempdir().unwrap();
        let segmenter = SimSegmenter::new().failing_with(PackagerError::Codec {
            reason: "bad codec".to_string(),
        });
        let (tx, _rx) = mpsc::channel(32);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let run_spec = SegmentSpec {
            input: temp.path().join("in.mkv"),
            output_dir: temp.path().join("hls"),
            mode: ConversionMode::StreamCopy,
        };
        let first = segmenter.run(run_spec.clone(), tx.clone(), cancel_rx.clone()).await;
        assert!(matches!(first, Err(PackagerError::Codec { .. })));

        let second = segmenter.run(run_spec, tx, cancel_rx).await;
        assert!(second.is_ok());
    }
}
