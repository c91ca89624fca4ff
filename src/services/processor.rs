//! The tus protocol state machine.
//!
//! `TusProcessor` is the only component allowed to mutate both the tracker and
//! the storage backend. The HTTP layer hands it parsed headers and a body
//! stream and gets back a [`TusResponse`] or a [`TusError`].
//!
//! Upload states: deferred length, known length, complete. A write is the only
//! way to move between them, and writes on one id are serialized through the
//! locker. Inspect, terminate and create are not.

use crate::{
    config::TusSettings,
    errors::{TusError, TusResult},
    models::{UploadLength, UploadMetadata, UploadResource},
    protocol::{
        TUS_CHECKSUM_ALGORITHM, TUS_EXTENSION, TUS_MAX_SIZE, TUS_RESUMABLE, TUS_VERSION,
        TUS_VERSION_HEADER, TusResponse, UPLOAD_CHECKSUM, UPLOAD_DEFER_LENGTH, UPLOAD_EXPIRES,
        UPLOAD_LENGTH, UPLOAD_METADATA, UPLOAD_OFFSET, check_upload_content_type, check_version,
        has_upload_content_type, header_str, http_date, parse_u64_header, wants_deferred_length,
    },
    services::{
        checksum::{ChecksumDeclaration, DigestStream, SUPPORTED_ALGORITHMS},
        events::{EventHooks, UploadEventKind},
        lock::{UploadLockGuard, UploadLocker},
        storage::Storage,
        stream::{BoundedStream, ByteStream},
        tracker::UploadTracker,
    },
};
use axum::http::{HeaderMap, StatusCode, header};
use chrono::Utc;
use futures::StreamExt;
use std::{slice, sync::Arc};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct TusProcessor {
    settings: Arc<TusSettings>,
    tracker: Arc<dyn UploadTracker>,
    storage: Arc<dyn Storage>,
    locker: Arc<dyn UploadLocker>,
    events: Arc<EventHooks>,
    extensions: Arc<str>,
}

/// Comma-separated `Tus-Extension` value for the given settings.
pub fn advertised_extensions(settings: &TusSettings) -> String {
    let mut extensions = Vec::new();
    if settings.enable_creation {
        extensions.push("creation");
        extensions.push("creation-with-upload");
    }
    extensions.push("creation-defer-length");
    extensions.push("expiration");
    if settings.enable_termination {
        extensions.push("termination");
    }
    extensions.push("checksum");
    extensions.join(",")
}

impl TusProcessor {
    pub fn new(
        settings: TusSettings,
        tracker: Arc<dyn UploadTracker>,
        storage: Arc<dyn Storage>,
        locker: Arc<dyn UploadLocker>,
        events: EventHooks,
    ) -> Self {
        let extensions = advertised_extensions(&settings).into();
        Self {
            settings: Arc::new(settings),
            tracker,
            storage,
            locker,
            events: Arc::new(events),
            extensions,
        }
    }

    pub fn settings(&self) -> &TusSettings {
        &self.settings
    }

    /// `OPTIONS`: server capabilities. Version is only checked when sent.
    pub fn discover(&self, headers: &HeaderMap) -> TusResult<TusResponse> {
        if headers.contains_key(TUS_RESUMABLE) {
            check_version(headers)?;
        }
        Ok(TusResponse::new(StatusCode::NO_CONTENT)
            .header(TUS_VERSION_HEADER, TUS_VERSION)
            .header(TUS_EXTENSION, &*self.extensions)
            .header(TUS_MAX_SIZE, self.settings.max_upload_length.to_string())
            .header(TUS_CHECKSUM_ALGORITHM, SUPPORTED_ALGORITHMS))
    }

    /// `POST {base}`: start a new upload, optionally carrying its first chunk.
    pub async fn create(
        &self,
        headers: &HeaderMap,
        request_path: &str,
        body: ByteStream,
    ) -> TusResult<TusResponse> {
        check_version(headers)?;
        if !self.settings.enable_creation {
            return Err(TusError::ExtensionDisabled("creation"));
        }

        let length = self.declared_creation_length(headers)?;
        let metadata = UploadMetadata::parse(header_str(headers, &UPLOAD_METADATA))
            .map_err(|err| TusError::malformed(err.to_string()))?;

        let id = Uuid::new_v4().simple().to_string();
        let upload = self.tracker.create(&id, length, metadata).await?;
        if let Err(err) = self.storage.create(&id).await {
            if let Err(cleanup) = self.tracker.remove(slice::from_ref(&id)).await {
                warn!("could not untrack upload {} after storage failure: {}", id, cleanup);
            }
            return Err(err.into());
        }

        info!("created upload {} (length {:?})", id, upload.length);
        self.events.dispatch(UploadEventKind::Created, &upload);
        if upload.is_complete() {
            info!("upload {} is empty and complete on creation", id);
            self.events.dispatch(UploadEventKind::Completed, &upload);
        }

        let mut response = TusResponse::new(StatusCode::CREATED)
            .no_store()
            .header(header::LOCATION, self.location(headers, request_path, &id))
            .header(UPLOAD_EXPIRES, http_date(upload.expires_at));

        let inline = has_upload_content_type(headers)
            && upload.length.known().is_some()
            && !upload.is_complete();
        if inline {
            let offset = match self.write_inline(&id, headers, body).await {
                Ok(written) => written.offset,
                Err(err) => {
                    warn!("inline data for new upload {} was not applied: {}", id, err);
                    self.tracker
                        .head(&id)
                        .await
                        .ok()
                        .flatten()
                        .map_or(0, |current| current.offset)
                }
            };
            response = response.header(UPLOAD_OFFSET, offset.to_string());
        }

        Ok(response)
    }

    /// `HEAD {base}/{id}`: current offset and length.
    pub async fn inspect(&self, id: &str, headers: &HeaderMap) -> TusResult<TusResponse> {
        check_version(headers)?;
        let upload = self.lookup(id).await?;

        let mut response = TusResponse::new(StatusCode::OK)
            .no_store()
            .header(UPLOAD_OFFSET, upload.offset.to_string())
            .header(UPLOAD_EXPIRES, http_date(upload.expires_at));
        response = match upload.length {
            UploadLength::Known(length) => response.header(UPLOAD_LENGTH, length.to_string()),
            UploadLength::Deferred => response.header(UPLOAD_DEFER_LENGTH, "1"),
        };
        if let Some(raw) = &upload.metadata.raw {
            response = response.header(UPLOAD_METADATA, raw);
        }
        Ok(response)
    }

    /// `PATCH {base}/{id}`: append a chunk.
    pub async fn write(
        &self,
        id: &str,
        headers: &HeaderMap,
        body: ByteStream,
    ) -> TusResult<TusResponse> {
        check_version(headers)?;
        check_upload_content_type(headers)?;
        let client_offset = parse_u64_header(headers, &UPLOAD_OFFSET)?
            .ok_or_else(|| TusError::malformed_for(id, "Upload-Offset header is required"))?;
        let declared_length = parse_u64_header(headers, &UPLOAD_LENGTH)?;
        let checksum = header_str(headers, &UPLOAD_CHECKSUM)
            .map(ChecksumDeclaration::parse)
            .transpose()?;

        let upload = self
            .apply_chunk(id, client_offset, declared_length, checksum, body)
            .await?;

        Ok(TusResponse::new(StatusCode::NO_CONTENT)
            .no_store()
            .header(UPLOAD_OFFSET, upload.offset.to_string())
            .header(UPLOAD_EXPIRES, http_date(upload.expires_at)))
    }

    /// `DELETE {base}/{id}`: drop the upload and its bytes.
    pub async fn terminate(&self, id: &str, headers: &HeaderMap) -> TusResult<TusResponse> {
        check_version(headers)?;
        if !self.settings.enable_termination {
            return Err(TusError::ExtensionDisabled("termination"));
        }
        if headers.contains_key(header::CONTENT_TYPE) {
            check_upload_content_type(headers)?;
        }

        let upload = self.lookup(id).await?;
        let ids = slice::from_ref(&upload.id);
        self.tracker.remove(ids).await?;
        self.storage.remove(ids).await?;

        info!("terminated upload {} at offset {}", id, upload.offset);
        self.events.dispatch(UploadEventKind::Terminated, &upload);
        Ok(TusResponse::new(StatusCode::NO_CONTENT).no_store())
    }

    /// Current state and the bytes acknowledged so far. Bytes of a write still
    /// in flight past the tracked offset are not included.
    pub async fn read(&self, id: &str) -> TusResult<(UploadResource, ByteStream)> {
        let upload = self.lookup(id).await?;
        let stream = self.storage.read(id).await?;
        let acknowledged = BoundedStream::new(stream, 0, upload.offset).boxed();
        Ok((upload, acknowledged))
    }

    /// Remove uploads whose expiry has passed. Uploads with a write in flight
    /// are left for the next sweep. Returns the removed ids.
    pub async fn sweep_expired(&self) -> TusResult<Vec<String>> {
        let expired = self.tracker.list_expired(false).await?;
        let mut removed = Vec::with_capacity(expired.len());
        for id in expired {
            let Some(guard) = UploadLockGuard::try_acquire(self.locker.as_ref(), &id) else {
                debug!("skipping expired upload {}: write in progress", id);
                continue;
            };
            match self.expire(&id).await {
                Ok(true) => removed.push(id.clone()),
                Ok(false) => {}
                Err(err) => warn!("could not expire upload {}: {}", id, err),
            }
            drop(guard);
        }
        if !removed.is_empty() {
            info!("expired {} upload(s)", removed.len());
        }
        Ok(removed)
    }

    /// Drop one listed upload if it is still expired. A write may have slid
    /// the window since the listing.
    async fn expire(&self, id: &str) -> TusResult<bool> {
        let still_expired = self
            .tracker
            .head(id)
            .await?
            .is_some_and(|upload| upload.is_expired_at(Utc::now()));
        if still_expired {
            let ids = [id.to_string()];
            self.tracker.remove(&ids).await?;
            self.storage.remove(&ids).await?;
        }
        Ok(still_expired)
    }

    /// Completed upload whose full payload hashed to `checksum`
    /// (`"<algorithm> <base64 digest>"`), if the tracker keeps that index.
    pub async fn find_by_checksum(&self, checksum: &str) -> TusResult<Option<UploadResource>> {
        let normalized = ChecksumDeclaration::parse(checksum)?.to_header_value();
        Ok(self.tracker.find_by_checksum(&normalized).await?)
    }

    pub async fn ping_tracker(&self) -> TusResult<()> {
        Ok(self.tracker.ping().await?)
    }

    pub async fn probe_storage(&self) -> TusResult<()> {
        Ok(self.storage.probe().await?)
    }

    fn declared_creation_length(&self, headers: &HeaderMap) -> TusResult<UploadLength> {
        let length = parse_u64_header(headers, &UPLOAD_LENGTH)?;
        let defer_header = header_str(headers, &UPLOAD_DEFER_LENGTH);
        if defer_header.is_some() && !wants_deferred_length(headers) {
            return Err(TusError::malformed("Upload-Defer-Length must be 1"));
        }

        match (length, defer_header.is_some()) {
            (Some(_), true) => Err(TusError::malformed(
                "Upload-Length and Upload-Defer-Length are mutually exclusive",
            )),
            (None, false) => Err(TusError::malformed(
                "either Upload-Length or Upload-Defer-Length is required",
            )),
            (None, true) => Ok(UploadLength::Deferred),
            (Some(length), false) => {
                self.check_size(length)?;
                Ok(UploadLength::Known(length))
            }
        }
    }

    fn check_size(&self, length: u64) -> TusResult<()> {
        if length > self.settings.max_upload_length {
            return Err(TusError::SizeExceeded {
                declared: length,
                max: self.settings.max_upload_length,
            });
        }
        Ok(())
    }

    async fn write_inline(
        &self,
        id: &str,
        headers: &HeaderMap,
        body: ByteStream,
    ) -> TusResult<UploadResource> {
        let checksum = header_str(headers, &UPLOAD_CHECKSUM)
            .map(ChecksumDeclaration::parse)
            .transpose()?;
        self.apply_chunk(id, 0, None, checksum, body).await
    }

    /// Resource by id, distinguishing terminated uploads from unknown ones.
    async fn lookup(&self, id: &str) -> TusResult<UploadResource> {
        if let Some(upload) = self.tracker.head(id).await? {
            return Ok(upload);
        }
        if self.tracker.was_removed(id).await? {
            Err(TusError::Gone(id.to_string()))
        } else {
            Err(TusError::NotFound(id.to_string()))
        }
    }

    fn location(&self, headers: &HeaderMap, request_path: &str, id: &str) -> String {
        let proxied = self
            .settings
            .location_header
            .as_deref()
            .and_then(|name| headers.get(name))
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let base = proxied.unwrap_or(request_path);
        format!("{}/{}", base.trim_end_matches('/'), id)
    }

    /// Apply `length` to an upload, declaring it if it is still deferred.
    async fn settle_length(
        &self,
        upload: UploadResource,
        length: u64,
    ) -> TusResult<UploadResource> {
        match upload.length {
            UploadLength::Known(known) if known == length => Ok(upload),
            UploadLength::Known(known) => Err(TusError::malformed_for(
                &upload.id,
                format!("Upload-Length is already {known} and cannot change"),
            )),
            UploadLength::Deferred => {
                self.check_size(length)?;
                if length < upload.offset {
                    return Err(TusError::malformed_for(
                        &upload.id,
                        format!("Upload-Length {length} is below the current offset {}", upload.offset),
                    ));
                }
                debug!("upload {} declared its length as {}", upload.id, length);
                Ok(self.tracker.update_length(&upload.id, length).await?)
            }
        }
    }

    /// The write algorithm shared by PATCH and creation-with-upload.
    ///
    /// Bytes below the tracked offset are skipped as already received, at
    /// most `min(max_chunk_size, remaining)` new bytes are consumed, and the
    /// tracked offset only ever moves to what storage reports as written.
    async fn apply_chunk(
        &self,
        id: &str,
        client_offset: u64,
        declared_length: Option<u64>,
        checksum: Option<ChecksumDeclaration>,
        body: ByteStream,
    ) -> TusResult<UploadResource> {
        let _guard = UploadLockGuard::try_acquire(self.locker.as_ref(), id).ok_or_else(|| {
            debug!("upload {} is locked by another write", id);
            TusError::Locked(id.to_string())
        })?;

        let mut upload = self.lookup(id).await?;
        let was_complete = upload.is_complete();
        if client_offset > upload.offset {
            return Err(TusError::OffsetConflict {
                id: id.to_string(),
                expected: upload.offset,
                received: client_offset,
            });
        }
        upload = match declared_length {
            Some(length) => self.settle_length(upload, length).await?,
            None if upload.is_deferred() => {
                return Err(TusError::malformed_for(
                    id,
                    "Upload-Length is required while the length is deferred",
                ));
            }
            None => upload,
        };

        let start = upload.offset;
        let skip = start - client_offset;
        let allowance = upload
            .remaining()
            .unwrap_or(0)
            .min(self.settings.max_chunk_size);
        let bounded = BoundedStream::new(body, skip, allowance);

        let end = match &checksum {
            None => {
                let mut bounded = bounded;
                self.storage.write(id, start, &mut bounded).await?
            }
            Some(declared) => {
                let mut digesting = DigestStream::new(bounded, declared.algorithm);
                let end = self.storage.write(id, start, &mut digesting).await?;
                if !declared.matches(&digesting.finalize()) {
                    self.storage.rollback(id, start).await?;
                    debug!(
                        "checksum mismatch on upload {}, rolled back {} bytes",
                        id,
                        end - start
                    );
                    return Err(TusError::ChecksumMismatch(id.to_string()));
                }
                end
            }
        };

        if end > start {
            upload = self.tracker.patch(id, end).await?;
        } else if skip > 0 {
            debug!("write to upload {} carried only already received bytes", id);
        }

        if !was_complete && upload.is_complete() {
            if let Some(declared) = checksum.filter(|_| start == 0) {
                let value = declared.to_header_value();
                match self.tracker.record_checksum(id, &value).await {
                    Ok(()) => upload.checksum = Some(value),
                    Err(err) => warn!("could not record checksum of upload {}: {}", id, err),
                }
            }
            info!("upload {} complete ({} bytes)", id, upload.offset);
            self.events.dispatch(UploadEventKind::Completed, &upload);
        }

        Ok(upload)
    }
}
