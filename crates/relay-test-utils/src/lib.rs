// relay-test-utils: Shared test doubles for the relay suite.
//
// Provides a scriptable mock editor and a raw framed client for
// integration testing the relay's routing, liveness and reload handling.

pub mod mock_client;
pub mod mock_editor;

pub use mock_client::MockClient;
pub use mock_editor::{MockEditor, MockEditorHandle};
