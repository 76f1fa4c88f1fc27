//! `mfsc` is the interactive line client for the `mfsd` server.

use mfs::prompt::prompt;
use mfs::proto::recv_frame;
use mfs::proto::send_frame;
use mfs::proto::COMMAND_LEN;
use mfs::proto::MSG_LEN;
use std::env;
use std::io;
use std::io::Write;
use std::net::TcpStream;
use std::process::exit;

/// The default server port.
const DEFAULT_PORT: u16 = 60000;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
	/// The name of the current program used in command line.
	prog: String,

	/// If true, print command line help.
	help: bool,

	/// The host to connect to.
	host: Option<String>,
	/// The port to connect to.
	port: Option<u16>,
}

fn parse_args() -> Args {
	let mut args: Args = Default::default();
	let mut iter = env::args();
	args.prog = iter.next().unwrap_or("mfsc".to_owned());

	for arg in iter {
		match arg.as_str() {
			"-h" | "--help" => args.help = true,
			_ if args.host.is_none() => args.host = Some(arg),
			_ if args.port.is_none() => args.port = arg.parse().ok(),
			_ => {}
		}
	}
	args
}

/// Prints command help.
fn print_help(prog: &str) {
	println!();
	println!("Usage:");
	println!(" {prog} [host] [port]");
	println!();
	println!("Connects to a mfsd server (default localhost:{DEFAULT_PORT}).");
}

/// Receives a reply frame, exiting when the server went away.
fn recv_reply(stream: &mut TcpStream) -> String {
	match recv_frame(stream, MSG_LEN) {
		Ok(Some(reply)) => reply,
		_ => {
			eprintln!("Connection closed by the server");
			exit(1);
		}
	}
}

fn main() {
	let args = parse_args();
	if args.help {
		print_help(&args.prog);
		return;
	}
	let host = args.host.unwrap_or_else(|| String::from("localhost"));
	let port = args.port.unwrap_or(DEFAULT_PORT);

	let mut stream = TcpStream::connect((host.as_str(), port)).unwrap_or_else(|_| {
		eprintln!("Connect to the server ({host}:{port}) failed!");
		exit(1);
	});
	println!("Connect to the server ({host}:{port}) success!");

	// login round-trips until the server accepts
	loop {
		let Some(username) = prompt("Please input your username: ", false) else {
			exit(1);
		};
		let Some(password) = prompt("Please input your password: ", true) else {
			exit(1);
		};
		let line = format!("login {username} {password}");
		if send_frame(&mut stream, &line, COMMAND_LEN).is_err() {
			eprintln!("Connection closed by the server");
			exit(1);
		}
		let reply = recv_reply(&mut stream);
		println!("{reply}");
		if reply == "login_success" {
			break;
		}
	}

	let stdin = io::stdin();
	loop {
		print!("> ");
		let _ = io::stdout().flush();

		let mut line = String::new();
		if stdin.read_line(&mut line).unwrap_or(0) == 0 {
			break;
		}
		let line = line.trim();
		if line.is_empty() {
			continue;
		}
		if line.len() >= COMMAND_LEN {
			println!("command is too long!");
			continue;
		}
		if send_frame(&mut stream, line, COMMAND_LEN).is_err() {
			eprintln!("Connection closed by the server");
			exit(1);
		}
		if line == "exit" || line == "logout" {
			break;
		}
		println!("{}", recv_reply(&mut stream));
	}
}
