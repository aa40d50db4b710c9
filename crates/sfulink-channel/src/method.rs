use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

macro_rules! methods {
    ($($variant:ident => $name:literal,)+) => {
        /// Operation names understood by the media worker.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Method {
            $($variant,)+
        }

        impl Method {
            /// Every known method, in declaration order.
            pub const ALL: &'static [Method] = &[$(Method::$variant,)+];

            /// Wire name of the method.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Method::$variant => $name,)+
                }
            }
        }

        impl FromStr for Method {
            type Err = UnknownMethod;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Method::$variant),)+
                    other => Err(UnknownMethod(other.to_string())),
                }
            }
        }
    };
}

methods! {
    WorkerClose => "worker.close",
    WorkerDump => "worker.dump",
    WorkerGetResourceUsage => "worker.getResourceUsage",
    WorkerUpdateSettings => "worker.updateSettings",
    WorkerCreateWebRtcServer => "worker.createWebRtcServer",
    WorkerCreateRouter => "worker.createRouter",
    WebRtcServerClose => "webRtcServer.close",
    WebRtcServerDump => "webRtcServer.dump",
    RouterClose => "router.close",
    RouterDump => "router.dump",
    RouterCreateWebRtcTransport => "router.createWebRtcTransport",
    RouterCreateWebRtcTransportWithServer => "router.createWebRtcTransportWithServer",
    RouterCreatePlainTransport => "router.createPlainTransport",
    RouterCreatePipeTransport => "router.createPipeTransport",
    RouterCreateDirectTransport => "router.createDirectTransport",
    RouterCreateActiveSpeakerObserver => "router.createActiveSpeakerObserver",
    RouterCreateAudioLevelObserver => "router.createAudioLevelObserver",
    TransportClose => "transport.close",
    TransportDump => "transport.dump",
    TransportGetStats => "transport.getStats",
    TransportConnect => "transport.connect",
    TransportSetMaxIncomingBitrate => "transport.setMaxIncomingBitrate",
    TransportSetMaxOutgoingBitrate => "transport.setMaxOutgoingBitrate",
    TransportRestartIce => "transport.restartIce",
    TransportProduce => "transport.produce",
    TransportConsume => "transport.consume",
    TransportProduceData => "transport.produceData",
    TransportConsumeData => "transport.consumeData",
    TransportEnableTraceEvent => "transport.enableTraceEvent",
    ProducerClose => "producer.close",
    ProducerDump => "producer.dump",
    ProducerGetStats => "producer.getStats",
    ProducerPause => "producer.pause",
    ProducerResume => "producer.resume",
    ProducerEnableTraceEvent => "producer.enableTraceEvent",
    ConsumerClose => "consumer.close",
    ConsumerDump => "consumer.dump",
    ConsumerGetStats => "consumer.getStats",
    ConsumerPause => "consumer.pause",
    ConsumerResume => "consumer.resume",
    ConsumerSetPreferredLayers => "consumer.setPreferredLayers",
    ConsumerSetPriority => "consumer.setPriority",
    ConsumerRequestKeyFrame => "consumer.requestKeyFrame",
    ConsumerEnableTraceEvent => "consumer.enableTraceEvent",
    DataProducerClose => "dataProducer.close",
    DataProducerDump => "dataProducer.dump",
    DataProducerGetStats => "dataProducer.getStats",
    DataConsumerClose => "dataConsumer.close",
    DataConsumerDump => "dataConsumer.dump",
    DataConsumerGetStats => "dataConsumer.getStats",
    RtpObserverClose => "rtpObserver.close",
    RtpObserverPause => "rtpObserver.pause",
    RtpObserverResume => "rtpObserver.resume",
    RtpObserverAddProducer => "rtpObserver.addProducer",
    RtpObserverRemoveProducer => "rtpObserver.removeProducer",
}

/// A method name the worker protocol does not define.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown method '{0}'")]
pub struct UnknownMethod(pub String);

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Method {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Method {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_wire_name() {
        let json = serde_json::to_string(&Method::WorkerGetResourceUsage).unwrap();
        assert_eq!(json, "\"worker.getResourceUsage\"");
    }

    #[test]
    fn unknown_name_is_rejected() {
        let err = "worker.explode".parse::<Method>().unwrap_err();
        assert_eq!(err.to_string(), "unknown method 'worker.explode'");
    }
}
