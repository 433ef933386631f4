pub mod optimize;
pub mod risk;
pub mod simulation;
pub mod statistics;

use serde::de::DeserializeOwned;

use crate::input;

/// Read a request from `--input` or piped stdin.
pub(crate) fn read_request<T: DeserializeOwned>(
    path: &Option<String>,
    command: &str,
) -> Result<T, Box<dyn std::error::Error>> {
    if let Some(p) = path {
        input::file::read_document(p)
    } else if let Some(request) = input::stdin::read_stdin()? {
        Ok(request)
    } else {
        Err(format!("--input <file.json|file.yaml> or stdin required for {}", command).into())
    }
}
