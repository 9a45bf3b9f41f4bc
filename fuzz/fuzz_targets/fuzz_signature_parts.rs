#![no_main]

use arbitrary::Arbitrary;
use boe_core::{PublicKeyRecoverer, SignatureParts, SoftwareRecoverer};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    hash: &'a [u8],
    r: &'a [u8],
    s: &'a [u8],
    v: u8,
}

fuzz_target!(|input: Input| {
    // Oversized components must be rejected, never truncated
    let parts = match SignatureParts::from_slices(input.hash, input.r, input.s, input.v) {
        Ok(parts) => parts,
        Err(_) => {
            assert!(input.hash.len() > 32 || input.r.len() > 32 || input.s.len() > 32);
            return;
        }
    };

    // Both encodings carry r and s right-aligned in the same slots
    let hw = parts.to_hardware_buffer();
    let sw = parts.to_software_buffer();
    assert_eq!(hw[..64], sw[..64]);
    assert_eq!(hw[96], sw[64]);
    assert_eq!(&hw[32 - input.r.len()..32], input.r);
    assert_eq!(&sw[64 - input.s.len()..64], input.s);
    assert_eq!(SignatureParts::from_hardware_buffer(&hw), parts);

    // Recovery may fail on garbage but must not panic
    let _ = SoftwareRecoverer.recover(&parts);
});
