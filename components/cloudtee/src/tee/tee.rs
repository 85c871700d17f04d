// Local crates
use crate::destination::{Destination, log_writer::LogWriter, object_writer::ObjectWriter};
use crate::helpers::load_config::Settings;
use crate::log_service::{LogService, cloudwatch::CloudWatchLogService};
use crate::tee::reader::DuplicatingReader;
use crate::writer::error::DestinationError;

// External crates
use object_store::{ObjectStore, aws::AmazonS3Builder};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::instrument;

/// Failures while setting up the tee.
#[derive(Debug, Error)]
pub enum TeeError {
    /// Neither destination is enabled.
    #[error("no destination")]
    NoDestination,

    /// The object destination could not be prepared.
    #[error("s3 writer: {0}")]
    Object(#[source] DestinationError),

    /// The log destination could not be prepared.
    #[error("cloudwatch logs writer: {0}")]
    Log(#[source] DestinationError),

    /// Two destinations resolved to the same locator.
    #[error("destination {0} is prepared more than once")]
    DuplicateLocator(String),

    /// A destination is enabled without a client for it.
    #[error("{0} is enabled but no client was provided")]
    MissingClient(&'static str),

    /// The S3 client could not be built.
    #[error("s3 client: {0}")]
    ObjectStoreClient(#[source] object_store::Error),
}

/// Remote clients, one per enabled destination kind.
#[derive(Default, Clone)]
pub struct TeeClients {
    /// Store for the object destination.
    pub object_store: Option<Arc<dyn ObjectStore>>,
    /// Service for the log destination.
    pub log_service: Option<Arc<dyn LogService>>,
}

impl fmt::Debug for TeeClients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeeClients")
            .field("object_store", &self.object_store.as_ref().map(|s| s.to_string()))
            .field("log_service", &self.log_service)
            .finish()
    }
}

/// Owns validated settings and clients, and prepares destinations for a run.
#[derive(Debug)]
pub struct Tee {
    settings: Settings,
    clients: TeeClients,
}

impl Tee {
    /// Build AWS clients for every enabled destination.
    #[instrument(name = "cloudtee_tee::new", target = "tee::tee", skip_all, level = "debug")]
    pub async fn new(settings: Settings) -> Result<Self, TeeError> {
        let mut clients = TeeClients::default();

        if let Some(s3) = &settings.s3 {
            let mut builder = AmazonS3Builder::from_env().with_bucket_name(&s3.bucket);
            if let Some(region) = &settings.aws_region {
                builder = builder.with_region(region);
            }
            let store = builder.build().map_err(TeeError::ObjectStoreClient)?;
            clients.object_store = Some(Arc::new(store));
        }

        if settings.cloudwatch.is_some() {
            let service = CloudWatchLogService::from_env(settings.aws_region.as_deref()).await;
            clients.log_service = Some(Arc::new(service));
        }

        Ok(Self::with_clients(settings, clients))
    }

    /// Use the given clients instead of building AWS ones.
    pub fn with_clients(settings: Settings, clients: TeeClients) -> Self {
        Self { settings, clients }
    }

    /// Prepare every enabled destination for `output_name`.
    ///
    /// Destinations prepared before a failure are aborted, so a failed call
    /// leaves no worker running.
    #[instrument(
        name = "cloudtee_tee::prepare_destinations",
        target = "tee::tee",
        skip_all,
        fields(output_name = %output_name),
        level = "debug"
    )]
    pub async fn prepare_destinations(
        &self,
        output_name: &str,
    ) -> Result<Vec<Destination>, TeeError> {
        let mut destinations: Vec<Destination> = Vec::new();

        match self.prepare_each(output_name, &mut destinations).await {
            Ok(()) if destinations.is_empty() => Err(TeeError::NoDestination),
            Ok(()) => Ok(destinations),
            Err(err) => {
                for destination in &mut destinations {
                    tracing::debug!(destination = %destination, "Rolling back prepared destination");
                    destination.abort();
                }
                Err(err)
            }
        }
    }

    async fn prepare_each(
        &self,
        output_name: &str,
        destinations: &mut Vec<Destination>,
    ) -> Result<(), TeeError> {
        let mut locators = HashSet::new();

        if let Some(s3) = &self.settings.s3 {
            let store = self
                .clients
                .object_store
                .clone()
                .ok_or(TeeError::MissingClient("s3"))?;
            let writer = ObjectWriter::new(store, s3, output_name)
                .await
                .map_err(TeeError::Object)?;
            register(&mut locators, destinations, writer.into())?;
        }

        if let Some(cloudwatch) = &self.settings.cloudwatch {
            let service = self
                .clients
                .log_service
                .clone()
                .ok_or(TeeError::MissingClient("cloudwatch logs"))?;
            let writer = LogWriter::new(service, cloudwatch, output_name)
                .await
                .map_err(TeeError::Log)?;
            register(&mut locators, destinations, writer.into())?;
        }

        Ok(())
    }

    /// Prepare destinations and wrap `source` so it feeds all of them.
    pub async fn tee_reader<R>(
        &self,
        source: R,
        output_name: &str,
    ) -> Result<DuplicatingReader<R>, TeeError>
    where
        R: AsyncRead + Unpin,
    {
        let destinations = self.prepare_destinations(output_name).await?;
        Ok(DuplicatingReader::new(source, destinations))
    }
}

fn register(
    locators: &mut HashSet<String>,
    destinations: &mut Vec<Destination>,
    mut destination: Destination,
) -> Result<(), TeeError> {
    let locator = destination.to_string();
    if !locators.insert(locator.clone()) {
        destination.abort();
        return Err(TeeError::DuplicateLocator(locator));
    }
    tracing::info!(destination = %locator, "Output destination prepared");
    destinations.push(destination);
    Ok(())
}
