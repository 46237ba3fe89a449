use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use vesta_repos::dispatch::{CallHandler, DispatchConfig, Dispatcher};
use vesta_repos::srpc::{Endpoint, EndpointConfig, Failure, WhichEnd};

struct EchoHandler;

#[async_trait::async_trait]
impl CallHandler for EchoHandler {
    async fn call(&self, _call_id: (i32, i32), endpoint: &mut Endpoint<TcpStream>) -> Result<(), Failure> {
        let v = endpoint.recv_int32().await?;
        endpoint.recv_end().await?;
        endpoint.send_int32(v * 2).await?;
        endpoint.send_end().await?;
        Ok(())
    }
}

#[tokio::test]
async fn dispatcher_serves_one_call_over_real_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dispatcher = Arc::new(Dispatcher::new(EchoHandler, DispatchConfig::default()));
    let serving = dispatcher.clone();
    tokio::spawn(async move {
        serving.serve_forever(listener).await;
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut client = Endpoint::handshake(stream, WhichEnd::Caller, EndpointConfig::default()).await.unwrap();

    client.start_call(1, -1).await.unwrap();
    client.send_int32(21).await.unwrap();
    client.send_end().await.unwrap();
    let reply = client.recv_int32().await.unwrap();
    client.recv_end().await.unwrap();

    assert_eq!(reply, 42);
}
