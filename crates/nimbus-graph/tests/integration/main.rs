//! Integration tests for the Graph adapter, using wiremock to stand
//! in for the API.

mod common;
mod test_delta;
mod test_items;
mod test_retry;
mod test_upload;
