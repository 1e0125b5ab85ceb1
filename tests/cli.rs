use std::io::Write;
use std::net::{SocketAddr, TcpListener};
use std::thread;
use std::time::Duration;

use assert_cmd::Command;
use calc_rpc::{Calculator, Service, StreamReactor};
use predicates::str::contains;
use tempfile::NamedTempFile;

fn endpoint_file(entries: &[(&str, u16, &str)]) -> NamedTempFile {
    let table: Vec<String> = entries
        .iter()
        .map(|(name, port, transport)| {
            format!(
                r#"{{"name":"{name}","address":"127.0.0.1","port":{port},"transport":"{transport}"}}"#
            )
        })
        .collect();
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "[{}]", table.join(",")).unwrap();
    file
}

fn client() -> Command {
    let mut cmd = Command::cargo_bin("calc-client").unwrap();
    cmd.timeout(Duration::from_secs(30));
    cmd
}

#[test]
fn client_exits_from_menu() {
    client()
        .write_stdin("5\n")
        .assert()
        .success()
        .stdout(contains("===== RPC CALCULATOR CLIENT ====="))
        .stdout(contains("Exiting client. Goodbye!"));
}

#[test]
fn client_rejects_bad_input() {
    client()
        .write_stdin("abc\n9\n1\none two\n5\n")
        .assert()
        .success()
        .stdout(contains("Invalid input. Please enter a number."))
        .stdout(contains("Invalid choice. Please try again."))
        .stdout(contains("Invalid input for numbers. Please enter two numbers."));
}

#[test]
fn client_reports_results_and_server_errors() {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let mut reactor =
        StreamReactor::bind(addr, Service::new(Calculator, "concurrent_tcp_async")).unwrap();
    let port = reactor.local_addr().unwrap().port();
    let shutdown = reactor.shutdown_handle();
    let handle = thread::spawn(move || reactor.run().unwrap());

    let table = endpoint_file(&[("reactor", port, "stream")]);
    client()
        .arg("--endpoints")
        .arg(table.path())
        .write_stdin("1\n2 3\n4\n1 0\n3\n1.5 -2\n5\n")
        .assert()
        .success()
        .stdout(contains("SUCCESS! Result from concurrent_tcp_async: 5.00"))
        .stdout(contains(
            "Server concurrent_tcp_async reported an error: Division by zero",
        ))
        .stdout(contains("SUCCESS! Result from concurrent_tcp_async: -3.00"));

    shutdown.trigger().unwrap();
    handle.join().unwrap();
}

#[test]
fn client_reports_when_every_server_is_down() {
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let table = endpoint_file(&[("nowhere", port, "stream")]);
    client()
        .args(["--timeout", "1", "--endpoints"])
        .arg(table.path())
        .write_stdin("2\n5 1\n5\n")
        .assert()
        .success()
        .stdout(contains("Failed to connect or get response from nowhere"))
        .stdout(contains(
            "Operation failed. All known servers tried or none could complete the request.",
        ));
}

#[test]
fn client_refuses_an_empty_table() {
    let table = endpoint_file(&[]);
    client()
        .arg("--endpoints")
        .arg(table.path())
        .write_stdin("5\n")
        .assert()
        .failure()
        .stderr(contains("the endpoint table is empty"));
}

#[test]
fn server_fails_on_a_taken_port() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap();
    Command::cargo_bin("calc-server")
        .unwrap()
        .args(["--mode", "iterative", "--transport", "tcp", "--addr"])
        .arg(addr.to_string())
        .timeout(Duration::from_secs(10))
        .assert()
        .failure()
        .stderr(contains(format!("cannot serve on {addr}")));
}

#[test]
fn server_rejects_unknown_mode() {
    Command::cargo_bin("calc-server")
        .unwrap()
        .args(["--mode", "forking"])
        .assert()
        .failure();
}
