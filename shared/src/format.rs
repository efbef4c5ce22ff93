use convert_base::Convert;

// ===== VALUE FORMATTING =====
//
// Display formatting is a rendering concern: the query core hands raw bit
// strings to the viewer and the viewer picks a view from this registry.
// The registry is an explicit object passed by reference into whatever
// renders values; nothing here is process-global.

/// A pure display transform: `(raw_value, width) -> display_string`.
pub type FormatFn = Box<dyn Fn(&str, u32) -> String + Send + Sync>;

/// One named view contributed by a plugin, e.g. "hexadecimal".
pub struct FormatView {
    pub name: String,
    pub apply: FormatFn,
}

/// A formatter plugin: an id plus its named views.
pub struct FormatPlugin {
    pub id: String,
    pub views: Vec<FormatView>,
}

/// Registry of formatter plugins, keyed by plugin id then view name.
#[derive(Default)]
pub struct FormatRegistry {
    plugins: Vec<FormatPlugin>,
}

pub const BUILTIN_PLUGIN_ID: &str = "builtin";

impl FormatRegistry {
    pub fn new() -> Self {
        FormatRegistry {
            plugins: Vec::new(),
        }
    }

    /// Registry pre-populated with the built-in views.
    pub fn with_builtins() -> Self {
        let mut registry = FormatRegistry::new();
        registry.register(FormatPlugin {
            id: BUILTIN_PLUGIN_ID.to_string(),
            views: vec![
                FormatView {
                    name: "binary".to_string(),
                    apply: Box::new(|raw, _| raw.to_string()),
                },
                FormatView {
                    name: "hexadecimal".to_string(),
                    apply: Box::new(|raw, width| format_radix(raw, width, 16)),
                },
                FormatView {
                    name: "unsigned".to_string(),
                    apply: Box::new(|raw, width| format_radix(raw, width, 10)),
                },
                FormatView {
                    name: "ascii".to_string(),
                    apply: Box::new(|raw, width| format_ascii(raw, width)),
                },
            ],
        });
        registry
    }

    /// A plugin registering under an existing id replaces the old one.
    pub fn register(&mut self, plugin: FormatPlugin) {
        self.plugins.retain(|p| p.id != plugin.id);
        self.plugins.push(plugin);
    }

    pub fn view(&self, plugin_id: &str, view_name: &str) -> Option<&FormatFn> {
        self.plugins
            .iter()
            .find(|p| p.id == plugin_id)
            .and_then(|p| p.views.iter().find(|v| v.name == view_name))
            .map(|v| &v.apply)
    }

    pub fn plugin_ids(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.id.as_str()).collect()
    }
}

/// Convert a bit string to the given radix. Values carrying `x`/`z` bits
/// (or any non-binary token) pass through unchanged.
fn format_radix(raw: &str, _width: u32, radix: u64) -> String {
    if raw.is_empty() || !raw.bytes().all(|b| b == b'0' || b == b'1') {
        return raw.to_string();
    }

    // convert-base works on little-endian digit vectors
    let digits: Vec<u8> = raw.bytes().rev().map(|b| b - b'0').collect();
    let mut convert = Convert::new(2, radix);
    let out: Vec<u8> = convert.convert::<u8, u8>(&digits);

    let mut text: String = out
        .iter()
        .rev()
        .map(|&d| char::from_digit(d as u32, radix as u32).unwrap_or('?'))
        .collect();
    if text.is_empty() {
        text.push('0');
    }
    text
}

/// Interpret the bit string as 8-bit characters, MSB first. Non-printable
/// bytes render as `.`.
fn format_ascii(raw: &str, _width: u32) -> String {
    if raw.is_empty() || !raw.bytes().all(|b| b == b'0' || b == b'1') {
        return raw.to_string();
    }

    let padding = (8 - raw.len() % 8) % 8;
    let padded: String = "0".repeat(padding) + raw;
    padded
        .as_bytes()
        .chunks(8)
        .map(|chunk| {
            let byte = chunk.iter().fold(0u8, |acc, &b| (acc << 1) | (b - b'0'));
            if (0x20..=0x7e).contains(&byte) {
                byte as char
            } else {
                '.'
            }
        })
        .collect()
}
