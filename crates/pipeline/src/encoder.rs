use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("failed to spawn encoder")]
    Spawn(#[source] std::io::Error),
    #[error("failed to probe source media: {0}")]
    Probe(String),
    #[error("encoder exited with status {0}")]
    Failed(std::process::ExitStatus),
    #[error("encoder i/o error")]
    Io(#[from] std::io::Error),
    #[error("encode cancelled")]
    Cancelled,
}

/// One output resolution of the transcoded ladder.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Tier {
    pub width: u32,
    pub height: u32,
    /// Video bitrate in Kbit/s.
    pub bitrate: u32,
}

/// The set of output tiers produced for every stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Ladder {
    pub tiers: Vec<Tier>,
}

impl Default for Ladder {
    fn default() -> Self {
        Self {
            tiers: vec![
                Tier { width: 1920, height: 1080, bitrate: 3500 },
                Tier { width: 1280, height: 720, bitrate: 2500 },
                Tier { width: 640, height: 360, bitrate: 500 },
                Tier { width: 256, height: 144, bitrate: 100 },
            ],
        }
    }
}

/// Result metadata of a finished encode.
#[derive(Debug, Clone)]
pub struct EncodeOutput {
    pub ladder: Ladder,
}

/// An in-flight encode. Progress percentages are monotonically
/// non-decreasing and the progress channel terminates before the result is
/// delivered.
pub struct Encoding {
    pub progress: mpsc::Receiver<f32>,
    pub result: oneshot::Receiver<Result<EncodeOutput, EncodeError>>,
}

/// The media encoder contract. Treated as a black box that turns an input
/// file into an HLS stream directory, yielding progress along the way.
///
/// `cancel` is the encoder's stop interface: once it fires, the encoder must
/// terminate any in-progress work before delivering its (then
/// [`EncodeError::Cancelled`]) result. Nothing may touch the output
/// directory under the encoder's feet until the result arrives.
#[async_trait::async_trait]
pub trait Encoder: Send + Sync + 'static {
    async fn encode(
        &self,
        input: &Path,
        out_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Encoding, EncodeError>;
}

/// Shells out to ffmpeg, deriving progress from its machine-readable
/// `-progress` output.
pub struct FfmpegEncoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    ladder: Ladder,
}

impl FfmpegEncoder {
    pub fn new() -> Self {
        Self {
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
            ladder: Ladder::default(),
        }
    }

    pub fn with_ladder(mut self, ladder: Ladder) -> Self {
        self.ladder = ladder;
        self
    }

    /// Source duration in seconds, used to turn encode timestamps into
    /// percentages.
    async fn probe_duration(&self, input: &Path) -> Result<f64, EncodeError> {
        let output = tokio::process::Command::new(&self.ffprobe)
            .args(["-v", "error", "-show_entries", "format=duration", "-of", "csv=p=0"])
            .arg(input)
            .output()
            .await
            .map_err(EncodeError::Spawn)?;
        if !output.status.success() {
            return Err(EncodeError::Probe(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<f64>()
            .map_err(|err| EncodeError::Probe(err.to_string()))
    }

    fn command(&self, input: &Path, out_dir: &Path) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.ffmpeg);
        // Backstop only: cancellation kills the child explicitly; this
        // covers the supervising task being torn down with the runtime.
        cmd.kill_on_drop(true);
        cmd.arg("-y").arg("-i").arg(input);

        for (index, tier) in self.ladder.tiers.iter().enumerate() {
            cmd.args(["-map", "0:v:0", "-map", "0:a:0"]);
            cmd.arg(format!("-filter:v:{index}"))
                .arg(format!("scale=-2:{}", tier.height));
            cmd.arg(format!("-b:v:{index}")).arg(format!("{}k", tier.bitrate));
        }
        let var_stream_map = (0..self.ladder.tiers.len())
            .map(|i| format!("v:{i},a:{i}"))
            .collect::<Vec<_>>()
            .join(" ");

        cmd.args(["-c:v", "libx264", "-c:a", "aac"])
            .args(["-f", "hls"])
            .args(["-hls_time", "6"])
            .args(["-hls_playlist_type", "vod"])
            .args(["-hls_segment_filename"])
            .arg(out_dir.join("var_%v/seg_%06d.ts"))
            .args(["-master_pl_name", "master.m3u8"])
            .args(["-var_stream_map", &var_stream_map])
            .args(["-progress", "pipe:1", "-nostats", "-loglevel", "error"])
            .arg(out_dir.join("var_%v.m3u8"));
        cmd
    }
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Encoder for FfmpegEncoder {
    #[tracing::instrument(skip(self, cancel))]
    async fn encode(
        &self,
        input: &Path,
        out_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Encoding, EncodeError> {
        let duration = self.probe_duration(input).await?;
        tokio::fs::create_dir_all(out_dir).await?;

        let mut child = self
            .command(input, out_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .spawn()
            .map_err(EncodeError::Spawn)?;
        let stdout = child.stdout.take().expect("encoder stdout is piped");

        let (progress_tx, progress_rx) = mpsc::channel(16);
        let (result_tx, result_rx) = oneshot::channel();
        let ladder = self.ladder.clone();
        let cancel = cancel.clone();

        // The supervising task owns the child: it forwards progress, and on
        // cancellation kills and reaps the subprocess before delivering the
        // result, so the output directory is quiescent once the result is
        // observable.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let result = loop {
                let line = tokio::select! {
                    () = cancel.cancelled() => {
                        let _ = child.kill().await;
                        break Err(EncodeError::Cancelled);
                    }
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        // `-progress` emits key=value pairs; out_time_us
                        // carries the current encode position.
                        let Some(us) = line.strip_prefix("out_time_us=") else {
                            continue;
                        };
                        let Ok(us) = us.trim().parse::<f64>() else {
                            continue;
                        };
                        if duration > 0.0 {
                            let percent =
                                ((us / 1e6) / duration * 100.0).clamp(0.0, 100.0) as f32;
                            if progress_tx.send(percent).await.is_err() {
                                // Consumer went away; stop encoding.
                                let _ = child.kill().await;
                                break Err(EncodeError::Cancelled);
                            }
                        }
                    }
                    Ok(None) => {
                        break match child.wait().await {
                            Ok(status) if status.success() => Ok(EncodeOutput { ladder }),
                            Ok(status) => Err(EncodeError::Failed(status)),
                            Err(err) => Err(EncodeError::Io(err)),
                        };
                    }
                    Err(err) => {
                        let _ = child.kill().await;
                        break Err(EncodeError::Io(err));
                    }
                }
            };
            drop(progress_tx);
            let _ = result_tx.send(result);
        });

        Ok(Encoding {
            progress: progress_rx,
            result: result_rx,
        })
    }
}
