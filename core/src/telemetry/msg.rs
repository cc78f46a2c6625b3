// Derived from https://github.com/tokio-rs/tracing/blob/e63ef57f3d686abe3727ddd586eb9af73d6715b7/tracing-appender/src/non_blocking.rs
// Under MIT license
#[derive(Debug)]
pub(crate) enum Msg {
	Line(Vec<u8>),
	Shutdown,
}
