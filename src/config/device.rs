//! Built-in device presets for emulation.

use crate::models::DeviceProfile;

const IPHONE_UA: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 15_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.0 Mobile/15E148 Safari/604.1";
const ANDROID_UA: &str = "Mozilla/5.0 (Linux; Android 11; Pixel 5) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";
const GALAXY_UA: &str = "Mozilla/5.0 (Linux; Android 10; SM-G981B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";
const IPAD_UA: &str = "Mozilla/5.0 (iPad; CPU OS 15_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.0 Mobile/15E148 Safari/604.1";
const DESKTOP_UA: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

fn preset(name: &str, width: u32, height: u32, user_agent: &str, touch: bool) -> DeviceProfile {
    DeviceProfile {
        name: name.to_string(),
        width,
        height,
        user_agent: user_agent.to_string(),
        touch,
    }
}

pub fn presets() -> Vec<DeviceProfile> {
    vec![
        preset("iPhone 12 Pro", 390, 844, IPHONE_UA, true),
        preset("iPhone SE", 375, 667, IPHONE_UA, true),
        preset("Pixel 5", 393, 851, ANDROID_UA, true),
        preset("Galaxy S20", 360, 800, GALAXY_UA, true),
        preset("iPad Air", 820, 1180, IPAD_UA, true),
        preset("Desktop 1920x1080", 1920, 1080, DESKTOP_UA, false),
    ]
}

/// Case-insensitive lookup by preset name
pub fn find(name: &str) -> Option<DeviceProfile> {
    let wanted = name.trim();
    presets()
        .into_iter()
        .find(|d| d.name.eq_ignore_ascii_case(wanted))
}

pub fn default_device() -> DeviceProfile {
    preset("iPhone 12 Pro", 390, 844, IPHONE_UA, true)
}
