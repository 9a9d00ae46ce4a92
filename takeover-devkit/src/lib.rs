/*!
# Takeover DevKit - in-memory collaborators for the takeover kernel

Stand-ins for every external service the kernel talks to:
- `FakeCompute`: compute platform (servers, flavors, images)
- `FakePlatform` / `FakeAdapterFactory`: external virtualization platforms
- `MockChannel`: remote command channel
- `MemoryStore`: platform and id-mapping store
- `MemorySink`: metrics sink
- `TestHarness`: a complete scheduler wired over all of the above
*/

pub mod channel_stub;
pub mod compute_stub;
pub mod metrics_stub;
pub mod platform_stub;
pub mod store_stub;
pub mod test_utils;

pub use channel_stub::MockChannel;
pub use compute_stub::FakeCompute;
pub use metrics_stub::MemorySink;
pub use platform_stub::{remote_vm, FakeAdapterFactory, FakePlatform};
pub use store_stub::MemoryStore;
pub use test_utils::TestHarness;
