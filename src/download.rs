use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use crate::errors::{Error, Result, TaskErrorKind};
use crate::protected::Protected;
use crate::queue::SerialQueue;
use crate::request::{Request, RequestConfig, Variant};
use crate::types::{HttpRequest, HttpResponse};

type BoxedStdError = Box<dyn std::error::Error + Send + Sync>;

/// How to finalize a downloaded file at its destination.
#[derive(Clone, Copy, Debug, Default)]
pub struct DownloadOptions {
    pub create_intermediate_directories: bool,
    pub remove_previous_file: bool,
}

/// Maps the transport's temporary location and the response to the final
/// location plus finalization options.
pub type Destination =
    Arc<dyn Fn(&Path, &HttpResponse) -> (PathBuf, DownloadOptions) + Send + Sync>;

/// Destination that always resolves to `path`, creating intermediate
/// directories and replacing any previous file.
pub fn destination_to(path: PathBuf) -> Destination {
    Arc::new(move |_, _| {
        (
            path.clone(),
            DownloadOptions {
                create_intermediate_directories: true,
                remove_previous_file: true,
            },
        )
    })
}

enum Downloadable {
    Request,
    ResumeData(Bytes),
}

pub(crate) struct DownloadCore {
    downloadable: Downloadable,
    destination: Destination,
    /// Resume data captured by `cancel_with_resume_data`; written from the
    /// transport's cancellation callback before completion is signaled.
    resume_data: Arc<Protected<Option<Bytes>>>,
    file_url: Protected<Option<PathBuf>>,
}

impl DownloadCore {
    fn new(downloadable: Downloadable, destination: Destination) -> Self {
        Self {
            downloadable,
            destination,
            resume_data: Arc::new(Protected::default()),
            file_url: Protected::default(),
        }
    }

    pub(crate) fn has_resume_source(&self) -> bool {
        self.resume_data.read(Option::is_some)
            || matches!(self.downloadable, Downloadable::ResumeData(_))
    }

    pub(crate) fn resume_source(&self) -> Bytes {
        if let Some(data) = self.resume_data.read(Clone::clone) {
            return data;
        }
        match &self.downloadable {
            Downloadable::ResumeData(data) => data.clone(),
            Downloadable::Request => Bytes::new(),
        }
    }

    pub(crate) fn resume_capture_slot(&self) -> Arc<Protected<Option<Bytes>>> {
        self.resume_data.clone()
    }

    pub(crate) fn resume_data(&self) -> Option<Bytes> {
        self.resume_data.read(Clone::clone)
    }

    pub(crate) fn file_url(&self) -> Option<PathBuf> {
        self.file_url.read(Clone::clone)
    }

    pub(crate) fn did_finish_downloading(&self, request: &Request, temporary: PathBuf) {
        let Some(response) = request.response() else {
            request.record_error(&Error::downloaded_file_move(
                "no response available to resolve the destination",
            ));
            return;
        };
        let (destination, options) = (self.destination)(&temporary, &response);
        match finalize(&temporary, &destination, options) {
            Ok(()) => self.file_url.write(|slot| *slot = Some(destination)),
            Err(error) => request.record_error(&error),
        }
    }

    pub(crate) fn reset(&self) {
        self.resume_data.write(|slot| *slot = None);
        self.file_url.write(|slot| *slot = None);
    }
}

fn finalize(temporary: &Path, destination: &Path, options: DownloadOptions) -> Result<()> {
    if options.create_intermediate_directories {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(Error::downloaded_file_move)?;
        }
    }
    if options.remove_previous_file && destination.exists() {
        fs::remove_file(destination).map_err(Error::downloaded_file_move)?;
    }
    if fs::rename(temporary, destination).is_err() {
        // Rename fails across filesystems; fall back to copy + remove.
        fs::copy(temporary, destination).map_err(Error::downloaded_file_move)?;
        fs::remove_file(temporary).map_err(Error::downloaded_file_move)?;
    }
    Ok(())
}

/// Terminal outcome of a download.
#[derive(Debug)]
pub struct DownloadResponse {
    pub request: Option<HttpRequest>,
    pub response: Option<HttpResponse>,
    /// Final location of the file on success.
    pub file_url: Option<PathBuf>,
    /// Resume data captured by a resumable cancellation, if any.
    pub resume_data: Option<Bytes>,
    pub retry_count: u32,
    pub result: Result<PathBuf>,
}

/// Request variant that streams the body to disk and finalizes it at a
/// caller-resolved destination.
#[derive(Clone)]
pub struct DownloadRequest {
    core: Request,
}

impl Deref for DownloadRequest {
    type Target = Request;

    fn deref(&self) -> &Request {
        &self.core
    }
}

impl DownloadRequest {
    pub fn new(
        config: RequestConfig,
        factory: impl Fn() -> Result<HttpRequest, BoxedStdError> + Send + Sync + 'static,
        destination: Destination,
    ) -> Self {
        let core = Request::build(
            config,
            Some(Box::new(factory)),
            Variant::Download(DownloadCore::new(Downloadable::Request, destination)),
        );
        Self { core }
    }

    /// Continue a previously cancelled download from its resume data.
    pub fn from_resume_data(
        config: RequestConfig,
        resume_data: Bytes,
        destination: Destination,
    ) -> Self {
        let core = Request::build(
            config,
            None,
            Variant::Download(DownloadCore::new(
                Downloadable::ResumeData(resume_data),
                destination,
            )),
        );
        Self { core }
    }

    fn download_core(&self) -> &DownloadCore {
        match &self.core.inner.variant {
            Variant::Download(core) => core,
            _ => unreachable!("download request constructed with download variant"),
        }
    }

    /// Cancel while asking the transport to produce resume data; the data is
    /// captured before cancellation completion is signaled.
    pub fn cancel_with_resume_data(&self) -> &Self {
        self.core.cancel_with_teardown(true);
        self
    }

    pub fn resume_data(&self) -> Option<Bytes> {
        self.download_core().resume_data()
    }

    /// Final file location, set once a finished download has been moved into
    /// place.
    pub fn file_url(&self) -> Option<PathBuf> {
        self.download_core().file_url()
    }

    /// Deliver the terminal download outcome on the default callback queue.
    pub fn response(&self, handler: impl FnOnce(DownloadResponse) + Send + 'static) -> &Self {
        self.response_on(self.core.callback_queue(), handler)
    }

    pub fn response_on(
        &self,
        queue: SerialQueue,
        handler: impl FnOnce(DownloadResponse) + Send + 'static,
    ) -> &Self {
        self.core
            .append_response_serializer(Box::new(move |request: &Request| {
                let snapshot = request.terminal_snapshot();
                let (file_url, resume_data) = match &request.inner.variant {
                    Variant::Download(core) => (core.file_url(), core.resume_data()),
                    _ => (None, None),
                };
                let result = match (&snapshot.error, &file_url) {
                    (Some(error), _) => Err(error.clone()),
                    (None, Some(path)) => Ok(path.clone()),
                    (None, None) => Err(Error::task(
                        TaskErrorKind::Other,
                        "download finished without producing a file",
                    )),
                };
                let response = DownloadResponse {
                    request: snapshot.request,
                    response: snapshot.response,
                    file_url,
                    resume_data,
                    retry_count: snapshot.retry_count,
                    result,
                };
                request.response_serializer_did_complete(Box::new(move || {
                    queue.dispatch(move || handler(response));
                }));
            }));
        self
    }
}
