//! Terminal rendering for pairing QR payloads.

use anyhow::{Result, anyhow};

/// Render a pairing QR payload into terminal-friendly unicode text.
pub fn render_qr_text(payload: &str) -> Result<String> {
    let payload = payload.trim();
    if payload.is_empty() {
        anyhow::bail!("QR payload is empty");
    }

    let qr = qrcode::QrCode::new(payload.as_bytes())
        .map_err(|err| anyhow!("failed to encode pairing QR payload: {err}"))?;

    Ok(qr
        .render::<qrcode::render::unicode::Dense1x2>()
        .quiet_zone(true)
        .build())
}
