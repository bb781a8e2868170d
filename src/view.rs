use std::fmt;
use std::str::FromStr;

/// Which composite is served to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewMode {
    /// Layers blended over the uploaded image
    #[default]
    Image,
    /// The extracted object: image under the union mask
    Masks,
    ColorMasks,
    WhiteMasks,
    /// Side-by-side diagnostic
    ComposeMasks,
}

impl ViewMode {
    pub const ALL: [ViewMode; 5] = [
        ViewMode::Image,
        ViewMode::Masks,
        ViewMode::ColorMasks,
        ViewMode::WhiteMasks,
        ViewMode::ComposeMasks,
    ];
}

impl fmt::Display for ViewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViewMode::Image => "image",
            ViewMode::Masks => "masks",
            ViewMode::ColorMasks => "colorMasks",
            ViewMode::WhiteMasks => "whiteMasks",
            ViewMode::ComposeMasks => "composeMasks",
        };
        f.write_str(name)
    }
}

impl FromStr for ViewMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ViewMode::ALL
            .into_iter()
            .find(|mode| mode.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown view '{s}'"))
    }
}

/// Tracks the selected view; switching never touches the composites
#[derive(Debug, Clone, Default)]
pub struct ViewRouter {
    current: ViewMode,
}

impl ViewRouter {
    pub fn new(initial: ViewMode) -> Self {
        Self { current: initial }
    }

    pub fn current(&self) -> ViewMode {
        self.current
    }

    pub fn select(&mut self, mode: ViewMode) {
        if mode != self.current {
            tracing::debug!("View {} -> {}", self.current, mode);
        }
        self.current = mode;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_case_insensitively() {
        for mode in ViewMode::ALL {
            assert_eq!(mode.to_string().parse::<ViewMode>().unwrap(), mode);
        }
        assert_eq!("COLORMASKS".parse::<ViewMode>().unwrap(), ViewMode::ColorMasks);
        assert!("negative".parse::<ViewMode>().is_err());
    }

    #[test]
    fn router_defaults_to_image() {
        let mut router = ViewRouter::default();
        assert_eq!(router.current(), ViewMode::Image);
        router.select(ViewMode::WhiteMasks);
        assert_eq!(router.current(), ViewMode::WhiteMasks);
    }
}
