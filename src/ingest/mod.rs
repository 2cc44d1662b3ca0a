pub mod overflow;
pub mod queue;
pub mod stats;
pub mod writer;

pub use queue::{ingest_channel, EventRecord, IngestQueue, RecordReceiver};
pub use stats::{FaultKind, IngestStats, WriterFault};
pub use writer::{spawn_batch_writer, StartupReport, WriterControl, WriterHandle, WriterShared, WriterStartup};
