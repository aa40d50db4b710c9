#![cfg(all(unix, feature = "async"))]

use serde_json::json;
use sfulink_channel::{Channel, Method, RoutingContext};
use sfulink_frame::{FrameReader, FrameWriter};
use sfulink_transport::{socket_pair, Transport};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_async_resolves_on_blocking_pool() {
    let (host, worker) = socket_pair().unwrap();
    let channel = Channel::new(Transport::from_stream(host).unwrap()).unwrap();

    let responder = std::thread::spawn(move || {
        let mut reader = FrameReader::new(worker.try_clone().unwrap());
        let mut writer = FrameWriter::new(worker);
        let mut request = None;
        while request.is_none() {
            reader
                .read_frames(|payload| {
                    request = Some(serde_json::from_slice::<serde_json::Value>(&payload).unwrap());
                })
                .unwrap();
        }
        let request = request.unwrap();
        let reply = json!({ "id": request["id"], "accepted": true, "data": { "ru_maxrss": 1024 } });
        writer.send(&serde_json::to_vec(&reply).unwrap()).unwrap();
    });

    let data = channel
        .request_async(Method::WorkerGetResourceUsage, RoutingContext::Worker, None)
        .await
        .unwrap();
    assert_eq!(data, Some(json!({ "ru_maxrss": 1024 })));

    responder.join().unwrap();
    channel.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_async_after_close_fails() {
    let (host, _worker) = socket_pair().unwrap();
    let channel = Channel::new(Transport::from_stream(host).unwrap()).unwrap();
    channel.close();

    let err = channel
        .request_async(Method::WorkerDump, RoutingContext::Worker, None)
        .await
        .unwrap_err();
    assert!(err.is_closed());
}
