use crate::unit::RgbaFrame;

/// Destination for paced frames (texture upload, encoder, counter).
///
/// Called only from the presentation thread.
pub trait PresentationSurface {
    fn upload(&mut self, frame: &RgbaFrame);
}

impl<F: FnMut(&RgbaFrame)> PresentationSurface for F {
    fn upload(&mut self, frame: &RgbaFrame) {
        self(frame)
    }
}
