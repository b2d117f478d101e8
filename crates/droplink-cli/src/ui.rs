//! Terminal output helpers.

use anyhow::Result;
use qrcode::render::unicode;
use qrcode::{EcLevel, QrCode};

/// This machine's display name on the network.
#[must_use]
pub fn device_name() -> String {
    hostname::get().map_or_else(
        |_| "this device".to_string(),
        |h| h.to_string_lossy().into_owned(),
    )
}

/// Print the access URL with a scannable QR code.
pub fn print_access(url: &str) {
    println!();
    println!("  Open this address in a browser on the same network:");
    println!();
    println!("    {url}");
    println!();
    if let Ok(qr) = qr_ascii(url) {
        println!("{qr}");
    }
}

/// Render a URL as a compact terminal QR code.
///
/// Uses Unicode half-block characters so the code stays scannable at
/// terminal cell proportions.
pub fn qr_ascii(url: &str) -> Result<String> {
    let code = QrCode::with_error_correction_level(url, EcLevel::M)
        .map_err(|e| anyhow::anyhow!("failed to generate QR code: {e}"))?;

    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qr_ascii_not_empty() {
        let qr = qr_ascii("http://192.168.1.20:52580").expect("render qr");
        assert!(!qr.is_empty());
        assert!(qr.lines().count() > 5);
    }
}
