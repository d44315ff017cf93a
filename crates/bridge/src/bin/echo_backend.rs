//! A backend worker that answers every `execute_graph` request with the
//! request's own expected outputs.
//!
//! `context_options.simulate` makes it misbehave:
//! `"crash"` exits without answering, `"silent"` never answers,
//! `"garbage"` answers with an undecodable body and `"fail"` reports a
//! runtime error.

use std::io::{self, BufRead, Write};

use wptnn_bridge::protocol::{error_kind, Request, Response, UNKNOWN_ID};

fn main() {
    env_logger::init();
    color_backtrace::install();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let raw = match line {
            Ok(raw) => raw,
            Err(err) => {
                log::error!("stdin: {err}");
                break;
            }
        };
        if raw.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&raw) {
            Ok(Request::ExecuteGraph { id, execution }) => {
                let simulate = execution
                    .context_options
                    .get("simulate")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                match simulate {
                    "crash" => std::process::exit(3),
                    "silent" => continue,
                    "garbage" => {
                        let _ = writeln!(stdout, "this is not json");
                        let _ = writeln!(stdout, r#"{{"id":"{id}","ok":true,"outputs":5}}"#);
                        let _ = stdout.flush();
                        continue;
                    }
                    "fail" => {
                        Response::failure(id, error_kind::RUNTIME_EXECUTION, "simulated failure")
                    }
                    _ => Response::success(id, execution.expected_outputs),
                }
            }
            Err(err) => Response::failure(
                UNKNOWN_ID,
                error_kind::BAD_REQUEST,
                format!("invalid json request: {err}"),
            ),
        };

        match serde_json::to_string(&response) {
            Ok(json) => {
                let _ = writeln!(stdout, "{json}");
                let _ = stdout.flush();
            }
            Err(err) => log::error!("response encode failed: {err}"),
        }
    }
}
