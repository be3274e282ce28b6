//! Stream sessions
//!
//! A session groups the selected device, the encoder process and the buffer
//! manager for one client request. Everything is created in
//! [`StreamTranscoder::start_session`] and torn down together, either when the
//! encoder output ends or when the response body is dropped because the
//! client went away.

use crate::buffer::{BufferConfig, BufferError, BufferManager, BufferStats};
use crate::config::{
    Config, ConfigError, HardwareSpec, TranscodeConfig, TranscodeMode, VideoCodec,
};
use crate::hardware::{
    can_encode, ensure_compatible, CompatibilityError, HardwareCatalog, HardwareDevice,
    HardwareSelector, SelectionError,
};
use crate::metrics::SharedMetrics;
use crate::transcode::{
    apply_adaptive, apply_hardware, build_profile, probe_stream, StreamInfo, TranscodeError,
    Transcoder, TranscoderOptions, TranscodingProfile,
};
use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::{self, Stream};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{info, info_span, warn, Instrument, Span};
use url::Url;
use uuid::Uuid;

/// Bytes handed to the response body per read
pub const RESPONSE_CHUNK_SIZE: usize = 32 * 1024;

/// Source URL schemes the encoder is allowed to open
pub const ALLOWED_SCHEMES: &[&str] = &["http", "https", "rtmp", "rtsp", "udp", "srt"];

/// Request-level error, reported before the first byte is sent
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("invalid source URL: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Compatibility(#[from] CompatibilityError),

    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Check that `raw` is an absolute URL with a supported scheme and a host.
pub fn validate_source_url(raw: &str) -> Result<Url, StreamError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| StreamError::InvalidUrl(format!("{}: {}", raw, e)))?;
    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        return Err(StreamError::InvalidUrl(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(StreamError::InvalidUrl(format!("missing host in '{}'", raw)));
    }
    Ok(url)
}

/// Everything a session needs from the configuration
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub transcode: TranscodeConfig,
    pub hardware: HardwareSpec,
    pub buffer: BufferConfig,
    pub encoder: TranscoderOptions,
    pub ffprobe_path: String,
    pub probe_timeout: Duration,
}

impl StreamSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            transcode: config.transcode.clone(),
            hardware: config.hardware_spec()?,
            buffer: BufferConfig::from(&config.buffer),
            encoder: TranscoderOptions {
                program: config.encoder.ffmpeg_path.clone(),
                leading_args: Vec::new(),
                close_grace: Duration::from_secs(config.encoder.close_grace_secs),
            },
            ffprobe_path: config.encoder.ffprobe_path.clone(),
            probe_timeout: Duration::from_secs(config.encoder.probe_timeout_secs),
        })
    }

    /// Video codec the encoder will be asked for
    fn requested_video_codec(&self) -> VideoCodec {
        match self.transcode.mode {
            TranscodeMode::Copy => VideoCodec::Copy,
            TranscodeMode::Transcode => self.transcode.video_codec,
        }
    }
}

struct Inner {
    settings: StreamSettings,
    selector: HardwareSelector,
    metrics: SharedMetrics,
    shutdown: CancellationToken,
}

/// Entry point for transcoded streams, shared by all requests
#[derive(Clone)]
pub struct StreamTranscoder {
    inner: Arc<Inner>,
}

impl StreamTranscoder {
    /// `shutdown` is the parent of every session token; cancelling it ends
    /// all running streams.
    pub fn new(
        settings: StreamSettings,
        catalog: HardwareCatalog,
        metrics: SharedMetrics,
        shutdown: CancellationToken,
    ) -> Self {
        let selector = HardwareSelector::new(catalog, settings.hardware);
        Self {
            inner: Arc::new(Inner {
                settings,
                selector,
                metrics,
                shutdown,
            }),
        }
    }

    pub fn catalog(&self) -> &HardwareCatalog {
        self.inner.selector.catalog()
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.inner.settings
    }

    /// Transcode `source_url` into an MPEG-TS response.
    ///
    /// Errors are only possible before streaming starts; afterwards a failure
    /// ends the body early.
    pub async fn transcode_stream(&self, source_url: &str) -> Result<Response, StreamError> {
        let session = self.start_session(source_url).await?;

        let headers = [
            ("content-type", "video/mp2t".to_string()),
            ("cache-control", "no-cache".to_string()),
            ("x-video-codec", session.profile.video_codec.to_string()),
            ("x-audio-codec", session.profile.audio_codec.to_string()),
            ("x-hardware-acceleration", session.device.kind.to_string()),
            ("x-session-id", session.id.clone()),
        ];
        Ok((headers, Body::from_stream(session.into_stream())).into_response())
    }

    /// Select hardware, build the profile and start the encoder and buffer.
    pub async fn start_session(&self, source_url: &str) -> Result<StreamSession, StreamError> {
        let id = Uuid::new_v4().to_string();
        let span = info_span!("stream", session = %id);

        match self.setup(id, source_url, span.clone()).instrument(span.clone()).await {
            Ok(session) => {
                self.inner.metrics.write().session_started();
                Ok(session)
            }
            Err(e) => {
                self.inner.metrics.write().session_failed();
                span.in_scope(|| warn!(error = %e, "Stream setup failed"));
                Err(e)
            }
        }
    }

    async fn setup(
        &self,
        id: String,
        source_url: &str,
        span: Span,
    ) -> Result<StreamSession, StreamError> {
        let inner = &self.inner;
        let settings = &inner.settings;
        validate_source_url(source_url)?;

        let codec = settings.requested_video_codec();
        let mut device = inner.selector.select(&settings.hardware)?;
        if !can_encode(&device, codec) {
            match settings.hardware {
                HardwareSpec::Auto => {
                    warn!(
                        device = %device.id(),
                        %codec,
                        "Selected hardware cannot encode codec, using CPU"
                    );
                    device = inner.selector.select(&HardwareSpec::Disabled)?;
                }
                _ => ensure_compatible(&device, codec)?,
            }
        }

        let mut profile = build_profile(&settings.transcode);
        if profile.is_adaptive() {
            let probed =
                probe_stream(&settings.ffprobe_path, source_url, settings.probe_timeout).await;
            let info = match probed {
                Ok(info) => info,
                Err(e) => {
                    warn!(error = %e, "Source probe failed, using default stream properties");
                    StreamInfo::default()
                }
            };
            apply_adaptive(&mut profile, &info);
        }
        apply_hardware(&mut profile, &device);
        let device_args = inner.selector.build_arguments(&device, &profile);

        let cancel = inner.shutdown.child_token();
        let mut transcoder =
            Transcoder::new(source_url, &device_args, &profile, settings.encoder.clone());
        transcoder.start(&cancel)?;

        let buffer = BufferManager::new(settings.buffer.clone());
        buffer.start(cancel.clone(), transcoder.take_output()?)?;

        info!(
            device = %device.id(),
            video_codec = %profile.video_codec,
            audio_codec = %profile.audio_codec,
            video_bitrate = %profile.video_bitrate,
            audio_bitrate = %profile.audio_bitrate,
            "Stream started"
        );

        Ok(StreamSession {
            id,
            device,
            profile,
            buffer,
            transcoder: Some(transcoder),
            metrics: inner.metrics.clone(),
            bytes_served: 0,
            finished: false,
            span,
            _cancel_on_drop: cancel.drop_guard(),
        })
    }
}

/// One running stream; dropping it cancels the encoder and the prefetch task
pub struct StreamSession {
    id: String,
    device: HardwareDevice,
    profile: TranscodingProfile,
    buffer: BufferManager,
    transcoder: Option<Transcoder>,
    metrics: SharedMetrics,
    bytes_served: u64,
    finished: bool,
    span: Span,
    _cancel_on_drop: DropGuard,
}

impl StreamSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device(&self) -> &HardwareDevice {
        &self.device
    }

    pub fn profile(&self) -> &TranscodingProfile {
        &self.profile
    }

    pub fn stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    /// Next chunk of encoded output; 0 at end of stream
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, BufferError> {
        let n = self.buffer.read(buf).await?;
        self.bytes_served += n as u64;
        Ok(n)
    }

    /// Close the buffer and the encoder, then log the session totals.
    pub async fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.buffer.close();

        if let Some(mut transcoder) = self.transcoder.take() {
            if let Err(e) = transcoder.close().instrument(self.span.clone()).await {
                self.span.in_scope(|| warn!(error = %e, "Encoder did not close cleanly"));
            }
        }

        let stats = self.buffer.stats();
        self.span.in_scope(|| {
            info!(
                bytes = self.bytes_served,
                underruns = stats.underruns,
                retries = stats.retries,
                "Stream finished"
            )
        });
    }

    /// Kill the encoder at once, then close like [`StreamSession::finish`].
    ///
    /// For a stalled encoder that will not exit on its own.
    pub async fn abort(&mut self) {
        if let Some(transcoder) = &self.transcoder {
            transcoder.kill();
        }
        self.finish().await;
    }

    /// Response body: chunks until end of stream, then the session closes.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
        stream::unfold(Some(self), |state| async move {
            let Some(mut session) = state else {
                return None;
            };
            let mut chunk = vec![0u8; RESPONSE_CHUNK_SIZE];
            match session.read(&mut chunk).await {
                Ok(0) => {
                    session.finish().await;
                    None
                }
                Ok(n) => {
                    chunk.truncate(n);
                    Some((Ok(Bytes::from(chunk)), Some(session)))
                }
                Err(e) => {
                    session.span.in_scope(|| warn!(error = %e, "Stream aborted"));
                    session.abort().await;
                    Some((Err(io::Error::new(io::ErrorKind::Other, e)), None))
                }
            }
        })
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if !self.finished {
            self.span.in_scope(|| {
                info!(bytes = self.bytes_served, "Client disconnected, cancelling stream")
            });
        }
        let stats = self.buffer.stats();
        self.metrics.write().session_finished(self.bytes_served, &stats);
    }
}
