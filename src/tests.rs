//! Integration tests driving the client and server over real links.

use crate::client::{Client, RemexError};
use crate::codec::{self, PacketType, ProtocolState, ProtocolVersion, Role};
use crate::server::{Server, ServerConfig};
use crate::transport::Endpoint;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;

async fn start_server(dir: &tempfile::TempDir, config_tweak: impl FnOnce(ServerConfig) -> ServerConfig)
-> (Endpoint, tokio::task::JoinHandle<()>) {
    let endpoint = Endpoint::Unix(dir.path().join("remex.sock"));
    let config = config_tweak(
        ServerConfig::new(endpoint.clone()).with_link_timeout(Duration::from_secs(10)),
    );
    let server = Server::new(config);
    let handle = tokio::spawn(async move {
        let _ = server.run().await;
    });

    // The listener binds on the first poll of the task.
    for _ in 0..200 {
        if endpoint.path().exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    (endpoint, handle)
}

fn client_for(endpoint: &Endpoint) -> Client {
    Client::new(endpoint.clone()).with_link_timeout(Duration::from_secs(10))
}

mod command {
    use super::*;

    #[tokio::test]
    async fn happy_path_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, _server) = start_server(&dir, |c| c).await;

        let output = client_for(&endpoint)
            .run_command_captured("tester", "echo hi", 65536)
            .await
            .unwrap();
        assert_eq!(output.status.major, 0);
        assert_eq!(output.status.minor, 0);
        assert_eq!(output.stdout, b"hi\n");
    }

    #[tokio::test]
    async fn nonzero_exit_lands_in_minor() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, _server) = start_server(&dir, |c| c).await;

        let status = client_for(&endpoint)
            .run_command_quiet("tester", "false")
            .await
            .unwrap();
        assert_eq!(status.major, 0);
        assert_eq!(status.minor, 1);
    }

    #[tokio::test]
    async fn split_mode_keeps_streams_apart() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, _server) = start_server(&dir, |c| c).await;

        let output = client_for(&endpoint)
            .run_command_split("tester", "echo to-out; echo to-err 1>&2", 65536)
            .await
            .unwrap();
        assert_eq!(output.stdout, b"to-out\n");
        assert_eq!(output.stderr, b"to-err\n");
    }

    #[tokio::test]
    async fn output_larger_than_one_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, _server) = start_server(&dir, |c| c).await;

        // 200k of output has to span several frames.
        let output = client_for(&endpoint)
            .run_command_captured("tester", "head -c 200000 /dev/zero", 1 << 20)
            .await
            .unwrap();
        assert_eq!(output.status.minor, 0);
        assert_eq!(output.stdout.len(), 200_000);
        assert!(output.stdout.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn buffer_overrun_is_receive_results() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, _server) = start_server(&dir, |c| c).await;

        let err = client_for(&endpoint)
            .run_command_captured("tester", "echo this does not fit", 4)
            .await
            .unwrap_err();
        assert!(matches!(err, RemexError::ReceiveResults(_)));
    }

    #[tokio::test]
    async fn bad_user_name_is_rejected_before_any_io() {
        // No server at all: validation fails before the link opens.
        let endpoint = Endpoint::Unix("/nonexistent/remex.sock".into());
        let err = Client::new(endpoint.clone())
            .run_command_quiet("not valid", "true")
            .await
            .unwrap_err();
        assert!(matches!(err, RemexError::Parameter(_)));

        let err = Client::new(endpoint)
            .run_command_quiet("tester", "")
            .await
            .unwrap_err();
        assert!(matches!(err, RemexError::Parameter(_)));
    }

    #[tokio::test]
    async fn interrupt_terminates_a_running_command() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, _server) = start_server(&dir, |c| c).await;

        let runner_endpoint = endpoint.clone();
        let runner = tokio::spawn(async move {
            client_for(&runner_endpoint)
                .run_command_quiet("tester", "sleep 30")
                .await
        });

        // Give the command time to start, then interrupt over a fresh link.
        tokio::time::sleep(Duration::from_millis(300)).await;
        client_for(&endpoint).interrupt().await.unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("command did not return after the interrupt")
            .unwrap()
            .unwrap();
        assert_eq!(status.major, 0);
        assert_eq!(status.minor, libc::SIGTERM as i64);
    }

    #[tokio::test]
    async fn server_side_command_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, _server) =
            start_server(&dir, |c| c.with_command_timeout(Duration::from_millis(300))).await;

        let err = client_for(&endpoint)
            .run_command_quiet("tester", "sleep 30")
            .await
            .unwrap_err();
        assert!(matches!(err, RemexError::Protocol(message) if message.contains("timed out")));
    }
}

mod inject {
    use super::*;

    #[tokio::test]
    async fn happy_path_copies_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, _server) = start_server(&dir, |c| c).await;

        let local = dir.path().join("source.bin");
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&local, &payload).unwrap();

        let remote = dir.path().join("dest.bin");
        client_for(&endpoint)
            .inject_file(
                "tester",
                local.to_str().unwrap(),
                remote.to_str().unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(&remote).unwrap(), payload);
    }

    #[tokio::test]
    async fn empty_file_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, _server) = start_server(&dir, |c| c).await;

        let local = dir.path().join("empty");
        std::fs::write(&local, b"").unwrap();
        let remote = dir.path().join("empty-out");

        client_for(&endpoint)
            .inject_file(
                "tester",
                local.to_str().unwrap(),
                remote.to_str().unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read(&remote).unwrap(), b"");
    }

    #[tokio::test]
    async fn unopenable_destination_fails_early() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, _server) = start_server(&dir, |c| c).await;

        let local = dir.path().join("source");
        std::fs::write(&local, b"data").unwrap();
        let remote = dir.path().join("no/such/dir/x");

        let err = client_for(&endpoint)
            .inject_file(
                "tester",
                local.to_str().unwrap(),
                remote.to_str().unwrap(),
            )
            .await
            .unwrap_err();
        match err {
            RemexError::RemoteFile(code) => assert_eq!(code, libc::ENOENT as i64),
            other => panic!("expected RemoteFile, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_local_file_is_a_local_error() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, _server) = start_server(&dir, |c| c).await;

        let err = client_for(&endpoint)
            .inject_file("tester", "/definitely/not/here", "/tmp/whatever")
            .await
            .unwrap_err();
        assert!(matches!(err, RemexError::LocalFile(_)));
    }
}

mod extract {
    use super::*;

    #[tokio::test]
    async fn happy_path_copies_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, _server) = start_server(&dir, |c| c).await;

        let remote = dir.path().join("remote.bin");
        let payload: Vec<u8> = (0..80_000u32).map(|i| (i % 239) as u8).collect();
        std::fs::write(&remote, &payload).unwrap();

        let local = dir.path().join("local.bin");
        client_for(&endpoint)
            .extract_file(
                "tester",
                remote.to_str().unwrap(),
                local.to_str().unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read(&local).unwrap(), payload);
    }

    #[tokio::test]
    async fn missing_remote_file_reports_the_errno() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, _server) = start_server(&dir, |c| c).await;

        let local = dir.path().join("never-written");
        let err = client_for(&endpoint)
            .extract_file("tester", "/definitely/not/here", local.to_str().unwrap())
            .await
            .unwrap_err();
        match err {
            RemexError::RemoteFile(code) => assert_eq!(code, libc::ENOENT as i64),
            other => panic!("expected RemoteFile, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn short_transfer_is_detected() {
        // A hand-rolled peer advertises 5 bytes, sends 2, then hangs up.
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("fake.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let fake_server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 256];
            let _ = stream.read(&mut request).await.unwrap();

            let ps = ProtocolState::new(ProtocolVersion::Legacy, 0, Role::Server);
            let size = codec::encode_uint(&ps, PacketType::Size, 5);
            let data = codec::encode(&ps, PacketType::Data, b"ab").unwrap();
            stream.write_all(&size).await.unwrap();
            stream.write_all(&data).await.unwrap();
            // Dropping the stream closes the link mid-transfer.
        });

        let local = dir.path().join("partial");
        let err = Client::new(Endpoint::Unix(socket))
            .with_link_timeout(Duration::from_secs(5))
            .extract_file("tester", "/some/file", local.to_str().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, RemexError::ReceiveFile(_)));

        // At most the two delivered bytes may have reached the disk.
        assert!(std::fs::read(&local).unwrap().len() <= 2);
        fake_server.await.unwrap();
    }
}

mod session {
    use super::*;

    #[tokio::test]
    async fn quit_stops_the_server() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, server) = start_server(&dir, |c| c).await;

        client_for(&endpoint).quit_server().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server did not stop after quit")
            .unwrap();
    }

    #[tokio::test]
    async fn multiplexed_header_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, _server) =
            start_server(&dir, |c| c.with_version(ProtocolVersion::Multiplexed)).await;

        let mut client = client_for(&endpoint).with_version(ProtocolVersion::Multiplexed);
        let output = client
            .run_command_captured("tester", "echo multiplexed", 65536)
            .await
            .unwrap();
        assert_eq!(output.stdout, b"multiplexed\n");

        // Transaction ids advance between operations on the same client.
        let status = client.run_command_quiet("tester", "true").await.unwrap();
        assert_eq!(status.minor, 0);
    }

    #[tokio::test]
    async fn sequential_operations_reuse_the_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, _server) = start_server(&dir, |c| c).await;
        let mut client = client_for(&endpoint);

        let first = client.run_command_quiet("tester", "true").await.unwrap();
        assert_eq!(first.minor, 0);

        let local = dir.path().join("f");
        std::fs::write(&local, b"xyz").unwrap();
        let remote = dir.path().join("g");
        client
            .inject_file("tester", local.to_str().unwrap(), remote.to_str().unwrap())
            .await
            .unwrap();

        let back = dir.path().join("h");
        client
            .extract_file("tester", remote.to_str().unwrap(), back.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&back).unwrap(), b"xyz");
    }

    #[tokio::test]
    async fn silent_peer_trips_the_link_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("mute.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let mute_server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Hold the connection open without ever answering.
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });

        let err = Client::new(Endpoint::Unix(socket))
            .with_link_timeout(Duration::from_millis(300))
            .run_command_quiet("tester", "true")
            .await
            .unwrap_err();
        assert!(matches!(err, RemexError::Protocol(message) if message.contains("timeout")));
        mute_server.abort();
    }
}
