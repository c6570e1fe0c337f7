//! End-to-end tests for the weaved binary.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Locate the weaved binary built by cargo.
fn weaved_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_weaved"))
}

#[test]
fn test_check_config_valid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weave.toml");
    std::fs::write(&path, "host = \"127.0.0.1\"\nport = 9001\n").unwrap();

    let output = Command::new(weaved_bin())
        .args(["check-config", path.to_str().unwrap()])
        .output()
        .expect("failed to run weaved check-config");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(": ok"), "stdout: {}", stdout);
    assert!(stdout.contains("port = 9001"), "stdout: {}", stdout);
    assert!(stdout.contains("max_handshake_bytes = 8192"), "stdout: {}", stdout);
}

#[test]
fn test_check_config_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weave.toml");
    std::fs::write(&path, "max_frame_bytes = 10\n").unwrap();

    let output = Command::new(weaved_bin())
        .args(["check-config", path.to_str().unwrap()])
        .output()
        .expect("failed to run weaved check-config");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.starts_with("error: "), "stderr: {}", stderr);
    assert!(stderr.contains("max_frame_bytes"), "stderr: {}", stderr);
}

#[test]
fn test_check_config_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::new(weaved_bin())
        .args(["check-config", dir.path().join("nope.toml").to_str().unwrap()])
        .output()
        .expect("failed to run weaved check-config");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to read"), "stderr: {}", stderr);
}

#[test]
fn test_serve_stops_on_quit() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("weaved.log");
    let config = dir.path().join("weave.toml");
    std::fs::write(
        &config,
        format!("log_file = {:?}\nlog_level = \"info\"\n", log.to_str().unwrap()),
    )
    .unwrap();

    let mut child = Command::new(weaved_bin())
        .args([
            "serve",
            "--config",
            config.to_str().unwrap(),
            "--host",
            "127.0.0.1",
            "--port",
            "0",
            "--workers",
            "1",
        ])
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn weaved serve");

    {
        let stdin = child.stdin.as_mut().unwrap();
        stdin.write_all(b"status\nquit\n").unwrap();
    }
    let output = child.wait_with_output().unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let logged = std::fs::read_to_string(&log).unwrap();
    assert!(logged.contains("weaved ready"), "log: {}", logged);
    assert!(logged.contains("server stopped"), "log: {}", logged);
}

/// Poll the log file until it contains `needle`, returning its contents.
#[cfg(unix)]
fn wait_for_log(path: &std::path::Path, needle: &str) -> String {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let logged = std::fs::read_to_string(path).unwrap_or_default();
        if logged.contains(needle) {
            return logged;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "{:?} never logged: {}",
            needle,
            logged
        );
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
}

#[cfg(unix)]
#[test]
fn test_sigterm_closes_connections() {
    use std::io::Read;
    use std::net::TcpStream;

    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("weaved.log");
    let config = dir.path().join("weave.toml");
    std::fs::write(
        &config,
        format!(
            "log_file = {:?}\nlog_level = \"info,weave_rt=trace\"\n",
            log.to_str().unwrap()
        ),
    )
    .unwrap();

    let mut child = Command::new(weaved_bin())
        .args([
            "serve",
            "--config",
            config.to_str().unwrap(),
            "--host",
            "127.0.0.1",
            "--port",
            "0",
            "--no-stdin",
        ])
        .env_remove("RUST_LOG")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn weaved serve");

    let logged = wait_for_log(&log, "weaved ready");
    let addr = logged
        .split_whitespace()
        .find_map(|field| field.strip_prefix("addr="))
        .expect("ready line carries the address")
        .to_string();

    let mut client = TcpStream::connect(&addr).unwrap();
    client
        .set_read_timeout(Some(std::time::Duration::from_secs(10)))
        .unwrap();
    client
        .write_all(
            b"GET / HTTP/1.1\r\n\
              Host: localhost\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              \r\n",
        )
        .unwrap();
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        client.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    assert!(head.starts_with(b"HTTP/1.1 101"));
    wait_for_log(&log, "client connected");

    // Masked empty ping, answered by an empty pong.
    client.write_all(&[0x89, 0x80, 0, 0, 0, 0]).unwrap();
    let mut pong = [0u8; 2];
    client.read_exact(&mut pong).unwrap();
    assert_eq!(pong, [0x8A, 0x00]);

    let status = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    // Close frame with status 1001.
    let mut close = [0u8; 4];
    client.read_exact(&mut close).unwrap();
    assert_eq!(close, [0x88, 0x02, 0x03, 0xE9]);

    let output = child.wait_with_output().unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let logged = std::fs::read_to_string(&log).unwrap();
    assert!(logged.contains("shutting down"), "log: {}", logged);
    assert!(logged.contains("client disconnected"), "log: {}", logged);
    assert!(logged.contains("server stopped"), "log: {}", logged);
    for line in ["frame received", "ping received", "opcode=Ping", "frame sent", "opcode=Close"] {
        assert!(logged.contains(line), "missing {:?} in log: {}", line, logged);
    }
}
