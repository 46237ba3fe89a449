use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use vesta_repos::dispatch::{CallHandler, DispatchConfig, Dispatcher};
use vesta_repos::pool::{IdleLimit, Pool};
use vesta_repos::srpc::{Endpoint, EndpointConfig, Failure};

struct NoopHandler;

#[async_trait::async_trait]
impl CallHandler for NoopHandler {
    async fn call(&self, _call_id: (i32, i32), endpoint: &mut Endpoint<TcpStream>) -> Result<(), Failure> {
        endpoint.recv_end().await?;
        endpoint.send_end().await
    }
}

async fn spawn_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dispatcher = Arc::new(Dispatcher::new(NoopHandler, DispatchConfig::default()));
    tokio::spawn(async move {
        dispatcher.serve_forever(listener).await;
    });
    addr
}

#[tokio::test]
async fn checkout_reuses_a_released_connection() {
    let addr = spawn_server().await;
    let pool = Pool::new(IdleLimit::Unbounded, EndpointConfig::default());

    let checkout = pool.checkout(&addr.ip().to_string(), addr.port()).await.unwrap();
    pool.release(checkout);

    let checkout = pool.checkout(&addr.ip().to_string(), addr.port()).await.unwrap();
    pool.release(checkout);

    assert_eq!(pool.stats().opens, 1, "second checkout should reuse the idle connection instead of dialing again");
}

#[tokio::test]
async fn fixed_idle_limit_closes_surplus_connections_on_release() {
    let addr = spawn_server().await;
    let pool = Pool::new(IdleLimit::Fixed(1), EndpointConfig::default());

    let a = pool.checkout(&addr.ip().to_string(), addr.port()).await.unwrap();
    let b = pool.checkout(&addr.ip().to_string(), addr.port()).await.unwrap();

    assert_eq!(pool.stats().opens, 2, "two concurrent checkouts must dial two distinct connections");

    pool.release(a);
    pool.release(b);

    assert_eq!(pool.stats().closed_limit, 1, "releasing past the fixed idle cap should close exactly the surplus entry");
}

#[tokio::test]
async fn purge_closes_all_idle_connections_for_a_key() {
    let addr = spawn_server().await;
    let pool = Pool::new(IdleLimit::Unbounded, EndpointConfig::default());

    let checkout = pool.checkout(&addr.ip().to_string(), addr.port()).await.unwrap();
    pool.release(checkout);

    pool.purge(&addr.ip().to_string(), addr.port());

    assert_eq!(pool.stats().closed_purge, 1);

    // The next checkout must dial fresh since purge cleared the idle cache.
    let checkout = pool.checkout(&addr.ip().to_string(), addr.port()).await.unwrap();
    pool.release(checkout);
    assert_eq!(pool.stats().opens, 2);
}
