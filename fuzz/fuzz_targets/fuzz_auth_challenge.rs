#![no_main]

use arbitrary::Arbitrary;
use boe_core::AuthChallenge;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    random: &'a [u8],
    host_id: &'a [u8],
    challenger_id: &'a [u8],
    signature: &'a [u8],
}

fuzz_target!(|input: Input| {
    let well_formed = input.random.len() == 32
        && input.host_id.len() == 32
        && input.challenger_id.len() == 64
        && input.signature.len() == 64;

    match AuthChallenge::from_slices(
        input.random,
        input.host_id,
        input.challenger_id,
        input.signature,
    ) {
        Some(challenge) => {
            assert!(well_formed);
            assert_eq!(&challenge.random[..], input.random);
            assert_eq!(&challenge.signature[..], input.signature);
        }
        None => assert!(!well_formed),
    }
});
