//! Broadcast sink.
//!
//! Publishes every handler call as a [`SinkEvent`] on a `tokio::sync::broadcast`
//! channel, so live views and message-broker bridges can follow the acquisition
//! without touching the context.

use anyhow::Result;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::data::dataset::{Dataset, SetType};
use crate::data::sink::{DataSink, DataSinkHandler, SinkEnv, SinkSettings};
use crate::data::value::{Metainfo, Quality, ResultMap, ValueMap};

/// One protocol call, as seen by a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    /// `prepare`
    Prepare {
        /// Dataset uid
        uid: Uuid,
        /// Dataset kind
        settype: SetType,
    },
    /// `begin`
    Begin {
        /// Dataset uid
        uid: Uuid,
        /// Dataset kind
        settype: SetType,
        /// Position within the parent
        number: usize,
    },
    /// `put_metainfo`
    Metainfo {
        /// Dataset uid
        uid: Uuid,
        /// Header entries
        metainfo: Metainfo,
    },
    /// `put_values`
    Values {
        /// Dataset uid
        uid: Uuid,
        /// Device values
        values: ValueMap,
    },
    /// `put_results`
    Results {
        /// Dataset uid
        uid: Uuid,
        /// Readout quality
        quality: Quality,
        /// Detector readings
        results: ResultMap,
    },
    /// `add_subset`
    AddSubset {
        /// Parent uid
        uid: Uuid,
        /// Parent kind
        settype: SetType,
        /// Child uid
        subset: Uuid,
    },
    /// `end`
    End {
        /// Dataset uid
        uid: Uuid,
        /// Dataset kind
        settype: SetType,
    },
}

impl SinkEvent {
    /// Uid of the dataset the event belongs to.
    pub fn uid(&self) -> Uuid {
        match self {
            SinkEvent::Prepare { uid, .. }
            | SinkEvent::Begin { uid, .. }
            | SinkEvent::Metainfo { uid, .. }
            | SinkEvent::Values { uid, .. }
            | SinkEvent::Results { uid, .. }
            | SinkEvent::AddSubset { uid, .. }
            | SinkEvent::End { uid, .. } => *uid,
        }
    }
}

/// Sink publishing [`SinkEvent`]s.
pub struct BroadcastSink {
    settings: SinkSettings,
    sender: broadcast::Sender<SinkEvent>,
}

impl BroadcastSink {
    /// Sink with a channel of the given capacity, active for all set types.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        let mut settings = SinkSettings::default();
        settings.active_in_simulation = true;
        Self { settings, sender }
    }

    /// Restrict to some set types.
    pub fn with_settings(mut self, settings: SinkSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Receive all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
        self.sender.subscribe()
    }
}

impl DataSink for BroadcastSink {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn settings(&self) -> &SinkSettings {
        &self.settings
    }

    fn create_handlers(&self, _dataset: &Dataset) -> Vec<Box<dyn DataSinkHandler>> {
        vec![Box::new(BroadcastHandler {
            sender: self.sender.clone(),
        })]
    }
}

struct BroadcastHandler {
    sender: broadcast::Sender<SinkEvent>,
}

impl BroadcastHandler {
    fn publish(&self, event: SinkEvent) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }
}

impl DataSinkHandler for BroadcastHandler {
    fn prepare(&mut self, dataset: &Dataset, _env: &SinkEnv) -> Result<()> {
        self.publish(SinkEvent::Prepare {
            uid: dataset.uid(),
            settype: dataset.settype(),
        })
    }

    fn begin(&mut self, dataset: &Dataset) -> Result<()> {
        self.publish(SinkEvent::Begin {
            uid: dataset.uid(),
            settype: dataset.settype(),
            number: dataset.base().number,
        })
    }

    fn put_metainfo(&mut self, dataset: &Dataset, metainfo: &Metainfo) -> Result<()> {
        self.publish(SinkEvent::Metainfo {
            uid: dataset.uid(),
            metainfo: metainfo.clone(),
        })
    }

    fn put_values(&mut self, dataset: &Dataset, values: &ValueMap) -> Result<()> {
        self.publish(SinkEvent::Values {
            uid: dataset.uid(),
            values: values.clone(),
        })
    }

    fn put_results(&mut self, dataset: &Dataset, quality: Quality, results: &ResultMap) -> Result<()> {
        self.publish(SinkEvent::Results {
            uid: dataset.uid(),
            quality,
            results: results.clone(),
        })
    }

    fn add_subset(&mut self, dataset: &Dataset, subset: &Dataset) -> Result<()> {
        self.publish(SinkEvent::AddSubset {
            uid: dataset.uid(),
            settype: dataset.settype(),
            subset: subset.uid(),
        })
    }

    fn end(&mut self, dataset: &Dataset) -> Result<()> {
        self.publish(SinkEvent::End {
            uid: dataset.uid(),
            settype: dataset.settype(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::{PointParams, ScanParams};
    use crate::data::manager::AcquisitionContext;
    use tempfile::tempdir;

    #[test]
    fn events_follow_the_dataset_lifecycle() {
        let dir = tempdir().unwrap();
        let sink = std::sync::Arc::new(BroadcastSink::new(64));
        let mut rx = sink.subscribe();
        let ctx = AcquisitionContext::builder()
            .data_root(dir.path())
            .sink(sink)
            .build();

        let scan_uid = ctx.begin_scan(ScanParams::default()).unwrap();
        let point_uid = ctx.begin_point(PointParams::default()).unwrap();
        ctx.finish_point();
        ctx.finish_scan();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 7);
        assert!(matches!(events[0], SinkEvent::Prepare { settype: SetType::Scan, .. }));
        assert!(matches!(events[3], SinkEvent::Begin { number: 1, .. }));
        assert_eq!(events[4], SinkEvent::End { uid: point_uid, settype: SetType::Point });
        assert_eq!(
            events[5],
            SinkEvent::AddSubset {
                uid: scan_uid,
                settype: SetType::Scan,
                subset: point_uid
            }
        );
        assert_eq!(events[6].uid(), scan_uid);
    }
}
