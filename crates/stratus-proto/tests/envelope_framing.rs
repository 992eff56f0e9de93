//! Integration tests for envelope framing.
//!
//! These tests exchange framed envelopes over real streams: raw frame reads
//! over TCP, and `tokio_util` framing over an in-memory duplex pipe.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use stratus_proto::codec::{Codec, FrameHeader, FRAME_HEADER_SIZE};
use stratus_proto::{
    Envelope, EnvelopeCodec, InvocationRequest, InvocationResponse, ParameterBinding,
    ProtocolError, StatusResult, WireValue, WorkerMessage,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Read one frame from the stream and decode it.
async fn read_envelope(stream: &mut TcpStream) -> Envelope {
    let mut header_buf = [0u8; FRAME_HEADER_SIZE];
    stream.read_exact(&mut header_buf).await.unwrap();

    let header = FrameHeader::decode(&header_buf).unwrap();
    let mut payload = vec![0u8; header.payload_len as usize];
    stream.read_exact(&mut payload).await.unwrap();

    Codec::decode(&payload).unwrap()
}

/// Echo server answering invocation requests with their input as output.
async fn run_echo_server(listener: TcpListener) {
    while let Ok((mut stream, _)) = listener.accept().await {
        tokio::spawn(async move {
            let mut codec = Codec::new();

            loop {
                let mut header_buf = [0u8; FRAME_HEADER_SIZE];
                if stream.read_exact(&mut header_buf).await.is_err() {
                    break;
                }

                let Ok(header) = FrameHeader::decode(&header_buf) else {
                    break;
                };

                let mut payload = vec![0u8; header.payload_len as usize];
                if stream.read_exact(&mut payload).await.is_err() {
                    break;
                }

                let Ok(envelope) = Codec::decode(&payload) else {
                    break;
                };

                let response = match envelope.payload {
                    WorkerMessage::InvocationRequest(req) => Envelope::response_to(
                        &envelope.header,
                        WorkerMessage::InvocationResponse(InvocationResponse {
                            invocation_id: req.invocation_id,
                            output_data: req.input_data,
                            return_value: None,
                            result: StatusResult::success(),
                            trace_context: None,
                            retry_context: None,
                        }),
                    ),
                    _ => continue,
                };

                let Ok(bytes) = codec.encode(&response).map(<[u8]>::to_vec) else {
                    break;
                };
                if stream.write_all(&bytes).await.is_err() {
                    break;
                }
                let _ = stream.flush().await;
            }
        });
    }
}

#[tokio::test]
async fn test_invocation_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(run_echo_server(listener));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut codec = Codec::new();

    let request = Envelope::new(
        "req-1",
        WorkerMessage::InvocationRequest(InvocationRequest::new(
            "inv-1",
            "fn-1",
            vec![ParameterBinding::new(
                "names",
                WireValue::CollectionString(vec!["a".into(), "b".into()]),
            )],
        )),
    );
    let bytes = codec.encode(&request).unwrap().to_vec();
    stream.write_all(&bytes).await.unwrap();
    stream.flush().await.unwrap();

    let response = read_envelope(&mut stream).await;
    assert_eq!(response.request_id(), "req-1");

    let WorkerMessage::InvocationResponse(resp) = response.payload else {
        panic!("expected invocation response");
    };
    assert_eq!(resp.invocation_id, "inv-1");
    assert_eq!(
        resp.output("names"),
        Some(&WireValue::CollectionString(vec!["a".into(), "b".into()]))
    );
}

#[tokio::test]
async fn test_framed_stream_preserves_order() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let mut writer = FramedWrite::new(client, EnvelopeCodec::new());
    let mut reader = FramedRead::new(server, EnvelopeCodec::new());

    for i in 0..5 {
        let envelope = Envelope::new(format!("req-{i}"), WorkerMessage::WorkerStatusRequest);
        writer.send(envelope).await.unwrap();
    }
    drop(writer);

    let mut seen = Vec::new();
    while let Some(envelope) = reader.next().await {
        seen.push(envelope.unwrap().header.request_id);
    }

    assert_eq!(seen, vec!["req-0", "req-1", "req-2", "req-3", "req-4"]);
}

#[tokio::test]
async fn test_oversized_frame_rejected_by_reader() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let mut writer = FramedWrite::new(client, EnvelopeCodec::new());
    let mut reader = FramedRead::new(server, EnvelopeCodec::with_max_message_size(32));

    let envelope = Envelope::new(
        "req-big",
        WorkerMessage::InvocationRequest(InvocationRequest::new(
            "inv-big",
            "fn-1",
            vec![ParameterBinding::new("body", WireValue::Bytes(vec![7; 1024]))],
        )),
    );
    writer.send(envelope).await.unwrap();

    let result = reader.next().await;
    assert!(matches!(
        result,
        Some(Err(ProtocolError::MessageTooLarge { max: 32, .. }))
    ));
}
