//! Shared value types: attachment formats and clear policies.

/// Pixel format of an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorFormat {
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba16Float,
    Rgba32Float,
    R32Float,
    Depth32Float,
    Depth24PlusStencil8,
}

impl ColorFormat {
    /// Whether this format is a depth (or depth-stencil) format.
    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth32Float | Self::Depth24PlusStencil8)
    }

    /// Bytes per pixel for this format.
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Rgba8Unorm | Self::Bgra8Unorm | Self::R32Float | Self::Depth32Float => 4,
            Self::Depth24PlusStencil8 => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }
}

/// Clear policy for an attachment at the start of a pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    /// Keep the previous contents.
    None,
    /// Clear to an RGBA color.
    Color([f32; 4]),
    /// Clear depth and stencil.
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Black, fully opaque.
    pub fn black() -> Self {
        Self::Color([0.0, 0.0, 0.0, 1.0])
    }

    /// Standard depth clear (far plane, zero stencil).
    pub fn far_depth() -> Self {
        Self::DepthStencil {
            depth: 1.0,
            stencil: 0,
        }
    }
}
