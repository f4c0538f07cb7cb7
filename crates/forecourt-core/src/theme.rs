// Brand palettes keyed by a station's `theme` column.

/// Two-tone palette the shell paints a station's screens with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    pub primary: &'static str,
    pub secondary: &'static str,
    pub background: &'static str,
    /// Primary colour at 25% alpha, used for glows and shadows.
    pub glow: &'static str,
}

const BPCL: Palette = Palette {
    primary: "#fbbf24",
    secondary: "#005ba3",
    background: "#fffbeb",
    glow: "#fbbf2440",
};
const IOCL: Palette = Palette {
    primary: "#f97316",
    secondary: "#003366",
    background: "#fff7ed",
    glow: "#f9731640",
};
const HPCL: Palette = Palette {
    primary: "#00418c",
    secondary: "#ed1c24",
    background: "#eff6ff",
    glow: "#00418c40",
};
const JIO: Palette = Palette {
    primary: "#00a651",
    secondary: "#e9da32",
    background: "#ecfdf5",
    glow: "#00a65140",
};
const DEFAULT: Palette = Palette {
    primary: "#2563eb",
    secondary: "#1e3a8a",
    background: "#eff6ff",
    glow: "#2563eb40",
};

pub fn palette_for(theme: Option<&str>) -> Palette {
    match theme {
        Some("bpcl") => BPCL,
        Some("iocl") => IOCL,
        Some("hpcl") => HPCL,
        Some("jio") => JIO,
        _ => DEFAULT,
    }
}
