//! Object store destination.
//!
//! Control flow:
//! 1. Derive the key from the configured prefix and the output name.
//! 2. Check the key. An existing object is a conflict unless overwriting is
//!    allowed; a failed check is only tolerated when overwriting is allowed.
//! 3. Optionally put an empty object first, to fail early on missing
//!    permissions.
//! 4. Spawn the upload worker: it streams the pipe into a buffered multipart
//!    upload, so memory stays bounded by the part size.

// Local crates
use crate::destination::ObjectDestination;
use crate::helpers::{load_config::S3Settings, naming::object_key};
use crate::writer::{
    error::DestinationError,
    scoped_writer::{ScopedWriter, WorkerContext},
};

// External crates
use object_store::{
    GetOptions, ObjectStore, PutOptions, PutPayload, buffered::BufWriter, path::Path,
};
use std::fmt;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

/// Part size of the multipart upload; payloads below it use a single PUT.
pub const UPLOAD_PART_SIZE: usize = 5 * 1024 * 1024;

/// Object destination: a scoped writer whose worker streams an upload.
#[derive(Debug)]
pub struct ObjectWriter {
    destination: ObjectDestination,
    inner: ScopedWriter,
}

impl ObjectWriter {
    /// Prepare the object destination for `output_name` and start uploading.
    #[instrument(
        name = "cloudtee_object_writer::new",
        target = "destination::object_writer",
        skip_all,
        fields(output_name = %output_name),
        level = "debug"
    )]
    pub async fn new(
        store: Arc<dyn ObjectStore>,
        settings: &S3Settings,
        output_name: &str,
    ) -> Result<Self, DestinationError> {
        let destination = ObjectDestination {
            bucket: settings.bucket.clone(),
            key: object_key(&settings.prefix, output_name),
        };
        let locator = destination.to_string();
        let path = Path::from(destination.key.as_str());

        match object_exists(store.as_ref(), &path).await {
            Ok(true) if !settings.allow_overwrite => {
                return Err(DestinationError::ObjectExists { locator });
            }
            Ok(true) => {
                tracing::info!(destination = %locator, "Object already exists and will be overwritten");
            }
            Ok(false) => {}
            Err(source) if !settings.allow_overwrite => {
                return Err(DestinationError::ObjectProbe { locator, source });
            }
            Err(err) => {
                tracing::warn!(
                    destination = %locator,
                    error = %err,
                    "Could not check for an existing object, continuing because overwrite is allowed"
                );
            }
        }

        if settings.firstly_put_empty_object {
            tracing::debug!(destination = %locator, "Putting empty object before upload");
            store
                .put_opts(
                    &path,
                    PutPayload::from_bytes(bytes::Bytes::new()),
                    PutOptions::default(),
                )
                .await
                .map_err(|source| DestinationError::ObjectPrepare {
                    locator: locator.clone(),
                    source,
                })?;
        }

        let inner = ScopedWriter::builder(locator)
            .worker(move |ctx| upload(store, path, ctx))
            .spawn()
            .await?;

        Ok(Self { destination, inner })
    }

    /// Forward `buf` to the upload.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, DestinationError> {
        self.inner.write(buf).await
    }

    /// End the input and wait for the upload to complete.
    pub async fn close(&mut self) -> Result<(), DestinationError> {
        tracing::debug!(destination = %self.destination, "Closing object writer");
        self.inner.close().await
    }

    pub(crate) fn abort(&mut self) {
        self.inner.abort();
    }
}

impl fmt::Display for ObjectWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.destination.fmt(f)
    }
}

async fn object_exists(store: &dyn ObjectStore, path: &Path) -> Result<bool, object_store::Error> {
    let options = GetOptions {
        head: true,
        ..GetOptions::default()
    };
    match store.get_opts(path, options).await {
        Ok(_) => Ok(true),
        Err(object_store::Error::NotFound { .. }) => Ok(false),
        Err(err) => Err(err),
    }
}

async fn upload(store: Arc<dyn ObjectStore>, path: Path, mut ctx: WorkerContext) {
    tracing::debug!("Start object upload");
    let mut target = BufWriter::with_capacity(store, path, UPLOAD_PART_SIZE);

    let result = match tokio::io::copy(&mut ctx.pipe, &mut target).await {
        Ok(copied) => target.shutdown().await.map(|()| copied),
        Err(err) => Err(err),
    };

    match result {
        Ok(copied) => tracing::debug!(bytes = copied, "Object upload completed"),
        Err(source) => {
            tracing::error!(error = %source, "Object upload failed");
            if let Err(abort_err) = target.abort().await {
                tracing::warn!(error = %abort_err, "Failed to abort multipart upload");
            }
            ctx.errors.report(DestinationError::Upload {
                locator: ctx.locator.to_string(),
                source,
            });
        }
    }
}
