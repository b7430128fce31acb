//! Publish server behaviour over real loopback sockets.

use std::net::SocketAddr;

use cpulink_agent::config::AgentConfig;
use cpulink_agent::source::ScriptedSource;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration, Instant};

fn test_config() -> AgentConfig {
    AgentConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        interval: Duration::from_millis(20),
    }
}

async fn read_line(reader: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    timeout(Duration::from_secs(2), reader.read_line(&mut line))
        .await
        .expect("line within timeout")
        .expect("read ok");
    line
}

async fn connect(addr: SocketAddr) -> BufReader<TcpStream> {
    BufReader::new(TcpStream::connect(addr).await.expect("connect agent"))
}

#[tokio::test]
async fn pushes_current_value_with_two_decimals() {
    let agent = cpulink_agent::start(&test_config(), ScriptedSource::constant(42.0))
        .await
        .unwrap();
    let mut reader = connect(agent.local_addr()).await;

    // The very first push may race the first tick; a few lines in it must be steady.
    let mut last = String::new();
    for _ in 0..5 {
        last = read_line(&mut reader).await;
    }
    assert_eq!(last, "42.00\n");

    agent.shutdown(Duration::from_secs(3)).await.unwrap();
}

#[tokio::test]
async fn pushes_repeat_even_when_value_is_unchanged() {
    let agent = cpulink_agent::start(&test_config(), ScriptedSource::constant(7.0))
        .await
        .unwrap();
    let mut reader = connect(agent.local_addr()).await;

    let started = Instant::now();
    for _ in 0..10 {
        read_line(&mut reader).await;
    }
    // 10 lines at a 20ms push period; generous upper bound for slow CI.
    assert!(started.elapsed() < Duration::from_secs(2));

    agent.shutdown(Duration::from_secs(3)).await.unwrap();
}

#[tokio::test]
async fn reader_input_is_ignored_without_stalling_pushes() {
    let agent = cpulink_agent::start(&test_config(), ScriptedSource::constant(3.25))
        .await
        .unwrap();
    let mut reader = connect(agent.local_addr()).await;

    reader
        .get_mut()
        .write_all(b"hello agent\nnot a command\n")
        .await
        .unwrap();
    // No trailing newline: a partial request must not block the write loop either.
    reader.get_mut().write_all(b"partial").await.unwrap();

    for _ in 0..5 {
        read_line(&mut reader).await;
    }
    assert_eq!(read_line(&mut reader).await, "3.25\n");

    agent.shutdown(Duration::from_secs(3)).await.unwrap();
}

#[tokio::test]
async fn half_closed_reader_keeps_receiving() {
    let agent = cpulink_agent::start(&test_config(), ScriptedSource::constant(12.5))
        .await
        .unwrap();
    let mut reader = connect(agent.local_addr()).await;

    reader.get_mut().write_all(b"hello\n").await.unwrap();
    // Same as `nc -N`: the reader's write side is finished, its read side is not.
    reader.get_mut().shutdown().await.unwrap();

    for _ in 0..5 {
        read_line(&mut reader).await;
    }
    assert_eq!(read_line(&mut reader).await, "12.50\n");
    assert_eq!(agent.state().clients(), 1);

    agent.shutdown(Duration::from_secs(3)).await.unwrap();
}

#[tokio::test]
async fn oversized_reader_input_does_not_stall_pushes() {
    let agent = cpulink_agent::start(&test_config(), ScriptedSource::constant(5.0))
        .await
        .unwrap();
    let mut reader = connect(agent.local_addr()).await;

    // 256 KiB with no newline, then a normal line.
    let flood = vec![b'z'; 256 * 1024];
    reader.get_mut().write_all(&flood).await.unwrap();
    reader.get_mut().write_all(b"\nafter\n").await.unwrap();

    for _ in 0..5 {
        read_line(&mut reader).await;
    }
    assert_eq!(read_line(&mut reader).await, "5.00\n");

    agent.shutdown(Duration::from_secs(3)).await.unwrap();
}

#[tokio::test]
async fn one_reader_leaving_does_not_affect_others() {
    let agent = cpulink_agent::start(&test_config(), ScriptedSource::constant(10.0))
        .await
        .unwrap();
    let addr = agent.local_addr();

    let mut stays = connect(addr).await;
    let leaves = connect(addr).await;
    read_line(&mut stays).await;

    let deadline = Instant::now() + Duration::from_secs(2);
    while agent.state().clients() < 2 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(agent.state().clients(), 2);

    drop(leaves);
    let deadline = Instant::now() + Duration::from_secs(2);
    while agent.state().clients() > 1 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(agent.state().clients(), 1);

    for _ in 0..3 {
        assert_eq!(read_line(&mut stays).await, "10.00\n");
    }

    agent.shutdown(Duration::from_secs(3)).await.unwrap();
}

#[tokio::test]
async fn shutdown_closes_readers_and_listener() {
    let agent = cpulink_agent::start(&test_config(), ScriptedSource::constant(1.0))
        .await
        .unwrap();
    let addr = agent.local_addr();
    let mut reader = connect(addr).await;
    read_line(&mut reader).await;

    agent.shutdown(Duration::from_secs(3)).await.unwrap();

    // Drain whatever was in flight; the stream must then reach EOF.
    let mut line = String::new();
    loop {
        line.clear();
        let n = timeout(Duration::from_secs(2), reader.read_line(&mut line))
            .await
            .expect("eof within timeout")
            .unwrap_or(0);
        if n == 0 {
            break;
        }
    }
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn bind_failure_is_reported() {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cfg = AgentConfig {
        listen: taken.local_addr().unwrap(),
        interval: Duration::from_millis(20),
    };
    let err = cpulink_agent::start(&cfg, ScriptedSource::constant(1.0))
        .await
        .err()
        .expect("port already bound");
    assert!(err.to_string().contains("failed to bind"));
}
