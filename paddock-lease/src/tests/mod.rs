
pub use stub_store::StubStore;
