use crate::context::Context;
use crate::image::{Arch, Endian, ImageView, Segment, SegmentFlags};

pub(crate) fn small_context() -> Context {
	Context::new(ImageView::new(Arch::X86, Endian::Little, 4, vec![]))
}

pub(crate) fn data_context(bytes: &[u8]) -> Context {
	let segment = Segment::new(".data", 0x1000, SegmentFlags::DATA, bytes);
	Context::new(ImageView::new(Arch::X86, Endian::Little, 4, vec![segment]))
}

pub(crate) fn context_with(arch: Arch, segments: Vec<Segment>) -> Context {
	Context::new(ImageView::new(arch, Endian::Little, 4, segments))
}
