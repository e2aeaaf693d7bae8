#![forbid(unsafe_code)]

//! Wire format of the spike exchange and the control channel toward
//! externally coupled simulators.

pub mod v1 {
    use prost::Enumeration;
    use prost::Message;
    use serde::{Deserialize, Serialize};

    /// Packed spike triple: `(source_gid, source_lid, time)`.
    #[derive(Clone, Copy, PartialEq, Serialize, Deserialize, Message)]
    pub struct SpikeRecord {
        #[prost(uint32, tag = "1")]
        pub source_gid: u32,
        #[prost(uint32, tag = "2")]
        pub source_lid: u32,
        #[prost(double, tag = "3")]
        pub time: f64,
    }

    /// One rank's contribution to the all-gather; `count` precedes the
    /// payload so origin partitions can be recovered from the counts vector.
    #[derive(Clone, PartialEq, Serialize, Deserialize, Message)]
    pub struct SpikeBatch {
        #[prost(uint32, tag = "1")]
        pub count: u32,
        #[prost(message, repeated, tag = "2")]
        pub spikes: Vec<SpikeRecord>,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Enumeration)]
    #[repr(i32)]
    pub enum ControlKind {
        Unknown = 0,
        Continue = 1,
        Done = 2,
    }

    /// Lifecycle message toward an externally coupled simulator.
    #[derive(Clone, Copy, PartialEq, Serialize, Deserialize, Message)]
    pub struct Control {
        #[prost(enumeration = "ControlKind", tag = "1")]
        pub kind: i32,
        #[prost(uint64, tag = "2")]
        pub epoch_id: u64,
        #[prost(double, tag = "3")]
        pub t0: f64,
        #[prost(double, tag = "4")]
        pub t1: f64,
    }

    /// Gap-junction site announcement gathered at initialization.
    #[derive(Clone, PartialEq, Serialize, Deserialize, Message)]
    pub struct GjSiteRecord {
        #[prost(uint32, tag = "1")]
        pub gid: u32,
        #[prost(uint32, tag = "2")]
        pub lid: u32,
        #[prost(string, tag = "3")]
        pub label: String,
        #[prost(uint32, tag = "4")]
        pub group: u32,
        #[prost(uint64, tag = "5")]
        pub cv: u64,
    }

    /// Labelled placement range announcement for label resolution.
    #[derive(Clone, PartialEq, Serialize, Deserialize, Message)]
    pub struct LabelRecord {
        #[prost(uint32, tag = "1")]
        pub gid: u32,
        #[prost(string, tag = "2")]
        pub label: String,
        #[prost(uint32, tag = "3")]
        pub begin: u32,
        #[prost(uint32, tag = "4")]
        pub end: u32,
    }
}

#[cfg(test)]
mod tests {
    use super::v1::*;
    use prost::Message;

    #[test]
    fn spike_batch_roundtrips() {
        let batch = SpikeBatch {
            count: 2,
            spikes: vec![
                SpikeRecord {
                    source_gid: 3,
                    source_lid: 0,
                    time: 1.25,
                },
                SpikeRecord {
                    source_gid: 7,
                    source_lid: 2,
                    time: 2.5,
                },
            ],
        };
        let bytes = batch.encode_to_vec();
        let decoded = SpikeBatch::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn control_carries_epoch_window() {
        let msg = Control {
            kind: ControlKind::Continue as i32,
            epoch_id: 4,
            t0: 4.0,
            t1: 5.0,
        };
        let bytes = msg.encode_to_vec();
        let decoded = Control::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.kind, ControlKind::Continue as i32);
        assert_eq!(decoded.epoch_id, 4);
    }
}
