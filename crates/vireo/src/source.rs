//! Byte sources: local files delivered whole, network streams delivered
//! as ordered chunks.
//!
//! A source runs on its own feeder thread and reports through the
//! [`MediaSourceEvents`](crate::events::MediaSourceEvents) observer:
//! ordered chunks, progress, the fast-start signal once the priority byte
//! window is down, completion, and classified failures. Chunk sizing and
//! range strategy are the HTTP stack's concern; the demuxer only requires
//! contiguous offsets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{header, Request, Uri};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use url::Url;

use crate::demux::FAST_START_WINDOW;
use crate::error::SourceError;
use crate::events::MediaSourceEvents;

const MAX_REDIRECTS: usize = 5;

/// A running byte source. `abort` is safe to call at any time; chunks may
/// still be in flight afterwards, which the controller's epoch token
/// filters out.
pub trait MediaSource: Send {
    /// True when the source delivers progressively (enables the demuxer's
    /// bounded window and the fast-start path).
    fn is_streamed(&self) -> bool;

    /// Starts delivery on a background thread.
    fn start(&mut self, events: Arc<dyn MediaSourceEvents>) -> Result<(), SourceError>;

    /// Requests the feeder to stop. Idempotent.
    fn abort(&mut self);
}

// ============================================================================
// Local file / in-memory sources
// ============================================================================

/// Local file source: the whole container arrives in one append.
pub struct FileSource {
    path: std::path::PathBuf,
    handle: Option<JoinHandle<()>>,
    aborted: Arc<AtomicBool>,
}

impl FileSource {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            path: path.into(),
            handle: None,
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl MediaSource for FileSource {
    fn is_streamed(&self) -> bool {
        false
    }

    fn start(&mut self, events: Arc<dyn MediaSourceEvents>) -> Result<(), SourceError> {
        let path = self.path.clone();
        let aborted = Arc::clone(&self.aborted);
        let handle = std::thread::Builder::new()
            .name("vireo-file-source".into())
            .spawn(move || {
                let data = match std::fs::read(&path) {
                    Ok(data) => data,
                    Err(e) => {
                        events.on_error(SourceError::Io(e));
                        return;
                    }
                };
                if aborted.load(Ordering::Acquire) {
                    return;
                }
                let total = data.len() as u64;
                events.on_chunk(Bytes::from(data), 0);
                events.on_progress(total, Some(total));
                events.on_fast_start();
                events.on_complete();
            })
            .map_err(|e| SourceError::Transport(format!("spawn file source: {e}")))?;
        self.handle = Some(handle);
        Ok(())
    }

    fn abort(&mut self) {
        self.aborted.store(true, Ordering::Release);
    }
}

/// Already-buffered source (embedder-supplied bytes, tests).
pub struct MemorySource {
    data: Option<Bytes>,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: Some(data.into()),
        }
    }
}

impl MediaSource for MemorySource {
    fn is_streamed(&self) -> bool {
        false
    }

    fn start(&mut self, events: Arc<dyn MediaSourceEvents>) -> Result<(), SourceError> {
        let Some(data) = self.data.take() else {
            return Ok(());
        };
        let total = data.len() as u64;
        events.on_chunk(data, 0);
        events.on_progress(total, Some(total));
        events.on_fast_start();
        events.on_complete();
        Ok(())
    }

    fn abort(&mut self) {}
}

// ============================================================================
// HTTP streaming source
// ============================================================================

/// Progressive HTTP source over hyper + rustls.
///
/// Streams the response body as ordered chunks and fires the fast-start
/// signal once the priority byte window has arrived (or the body completed
/// earlier). Follows up to [`MAX_REDIRECTS`] redirects.
pub struct HttpSource {
    url: String,
    fast_start_bytes: u64,
    handle: Option<JoinHandle<()>>,
    aborted: Arc<AtomicBool>,
}

impl HttpSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            fast_start_bytes: FAST_START_WINDOW,
            handle: None,
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Overrides the fast-start byte threshold.
    pub fn with_fast_start_bytes(mut self, bytes: u64) -> Self {
        self.fast_start_bytes = bytes;
        self
    }
}

impl MediaSource for HttpSource {
    fn is_streamed(&self) -> bool {
        true
    }

    fn start(&mut self, events: Arc<dyn MediaSourceEvents>) -> Result<(), SourceError> {
        let url = self.url.clone();
        let fast_start_bytes = self.fast_start_bytes;
        let aborted = Arc::clone(&self.aborted);

        let handle = std::thread::Builder::new()
            .name("vireo-http-source".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        events.on_error(SourceError::Transport(format!("tokio runtime: {e}")));
                        return;
                    }
                };
                let result = runtime.block_on(stream_url(
                    &url,
                    fast_start_bytes,
                    &aborted,
                    events.as_ref(),
                ));
                match result {
                    Ok(()) => events.on_complete(),
                    Err(e) => events.on_error(e),
                }
            })
            .map_err(|e| SourceError::Transport(format!("spawn http source: {e}")))?;
        self.handle = Some(handle);
        Ok(())
    }

    fn abort(&mut self) {
        self.aborted.store(true, Ordering::Release);
    }
}

async fn stream_url(
    url: &str,
    fast_start_bytes: u64,
    aborted: &AtomicBool,
    events: &dyn MediaSourceEvents,
) -> Result<(), SourceError> {
    let mut current_uri: Uri = url
        .parse()
        .map_err(|_| SourceError::Url(url.to_string()))?;

    let https = HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|e| SourceError::Tls(format!("native root certificates: {e}")))?
        .https_or_http()
        .enable_http1()
        .build();

    let client: Client<_, Empty<Bytes>> = Client::builder(TokioExecutor::new()).build(https);

    let mut redirects = 0;
    let response = loop {
        let authority = current_uri
            .authority()
            .ok_or_else(|| SourceError::Url(format!("missing host in {current_uri}")))?
            .clone();

        let request = Request::builder()
            .uri(current_uri.clone())
            .header(header::HOST, authority.as_str())
            .body(Empty::<Bytes>::new())
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let response = client
            .request(request)
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        if response.status().is_redirection() {
            if redirects >= MAX_REDIRECTS {
                return Err(SourceError::TooManyRedirects);
            }
            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or(SourceError::BadRedirect)?;
            // Drain the redirect body before reusing the connection.
            response
                .into_body()
                .collect()
                .await
                .map_err(|e| SourceError::Transport(e.to_string()))?;
            current_uri = resolve_redirect(&current_uri, &location)?;
            redirects += 1;
            continue;
        }
        if !response.status().is_success() {
            return Err(SourceError::HttpStatus(response.status().as_u16()));
        }
        break response;
    };

    let total: Option<u64> = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());

    let mut body = response.into_body();
    let mut offset = 0u64;
    let mut fast_start_fired = false;

    while let Some(frame) = body.frame().await {
        if aborted.load(Ordering::Acquire) {
            tracing::debug!("http source aborted at offset {offset}");
            return Ok(());
        }
        let frame = frame.map_err(|e| SourceError::Transport(e.to_string()))?;
        if let Ok(chunk) = frame.into_data() {
            let len = chunk.len() as u64;
            events.on_chunk(chunk, offset);
            offset += len;
            events.on_progress(offset, total);
            if !fast_start_fired && offset >= fast_start_bytes {
                fast_start_fired = true;
                events.on_fast_start();
            }
        }
    }

    if !fast_start_fired {
        // Short bodies: the whole file is the priority window.
        events.on_fast_start();
    }
    Ok(())
}

fn resolve_redirect(current: &Uri, location: &str) -> Result<Uri, SourceError> {
    if let Ok(uri) = location.parse::<Uri>() {
        if uri.scheme().is_some() {
            return Ok(uri);
        }
    }
    let base = Url::parse(&current.to_string()).map_err(|_| SourceError::BadRedirect)?;
    let joined = base.join(location).map_err(|_| SourceError::BadRedirect)?;
    joined
        .as_str()
        .parse::<Uri>()
        .map_err(|_| SourceError::BadRedirect)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        chunks: Mutex<Vec<(u64, usize)>>,
        fast_start: AtomicBool,
        complete: AtomicBool,
    }

    impl MediaSourceEvents for Recorder {
        fn on_chunk(&self, data: Bytes, offset: u64) {
            self.chunks.lock().push((offset, data.len()));
        }
        fn on_fast_start(&self) {
            self.fast_start.store(true, Ordering::Release);
        }
        fn on_complete(&self) {
            self.complete.store(true, Ordering::Release);
        }
    }

    #[test]
    fn memory_source_delivers_whole_buffer() {
        let recorder = Arc::new(Recorder::default());
        let mut source = MemorySource::new(vec![0u8; 1024]);
        source.start(Arc::clone(&recorder) as Arc<dyn MediaSourceEvents>).unwrap();
        assert_eq!(recorder.chunks.lock().as_slice(), &[(0, 1024)]);
        assert!(recorder.fast_start.load(Ordering::Acquire));
        assert!(recorder.complete.load(Ordering::Acquire));
    }

    #[test]
    fn file_source_reports_missing_file() {
        struct ErrorFlag(AtomicBool);
        impl MediaSourceEvents for ErrorFlag {
            fn on_chunk(&self, _data: Bytes, _offset: u64) {}
            fn on_error(&self, _error: SourceError) {
                self.0.store(true, Ordering::Release);
            }
        }

        let flag = Arc::new(ErrorFlag(AtomicBool::new(false)));
        let mut source = FileSource::new("/definitely/not/a/real/path.mp4");
        source.start(Arc::clone(&flag) as Arc<dyn MediaSourceEvents>).unwrap();
        // The feeder thread is short-lived; wait for it.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while !flag.0.load(Ordering::Acquire) && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(flag.0.load(Ordering::Acquire));
    }

    #[test]
    fn redirect_resolution_handles_relative_locations() {
        let base: Uri = "http://example.com/videos/movie.mp4".parse().unwrap();
        let resolved = resolve_redirect(&base, "/cdn/movie.mp4").unwrap();
        assert_eq!(resolved.to_string(), "http://example.com/cdn/movie.mp4");

        let absolute = resolve_redirect(&base, "https://cdn.example.com/m.mp4").unwrap();
        assert_eq!(absolute.to_string(), "https://cdn.example.com/m.mp4");
    }
}
