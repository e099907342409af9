//! `taskgate` core: task envelopes, worker result frames and API error bodies.

pub mod error;
pub mod request;
pub mod result;
pub mod task;

pub use error::{ErrorBody, ErrorDetail, ErrorKind};
pub use request::{parse_client_request, ClientRequest, ParsedRequest, RequestError};
pub use result::{payload_bytes, TaskResult, TaskStreamResult};
pub use task::{topic_for_model, Task, TaskMetadata, MODEL_TOPIC_PREFIX};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
