use cie_sdk::{InternalAuthResult, MrtdResult, ReadResult};

use crate::utils::Encoding;

pub(super) fn print_result(result: &ReadResult, encoding: Encoding) {
    match result {
        ReadResult::Attributes(attributes) => {
            println!("ATR: {}", hex::encode_upper(&attributes.atr));
            println!("Card profile: {}", attributes.card_profile);
        }
        ReadResult::Authentication(authentication) => {
            println!("{}", authentication.redirect_url);
        }
        ReadResult::InternalAuth(bundle) => print_internal_auth(bundle, encoding),
        ReadResult::Mrtd(mrtd) => print_mrtd(mrtd, encoding),
        ReadResult::InternalAuthAndMrtd(combined) => {
            print_mrtd(&combined.mrtd_data, encoding);
            print_internal_auth(&combined.nis_data, encoding);
        }
        ReadResult::Certificate(certificate) => {
            let field = |value: &Option<String>| value.as_deref().unwrap_or("-").to_owned();
            println!("Name: {}", field(&certificate.name));
            println!("Surname: {}", field(&certificate.surname));
            println!("Fiscal code: {}", field(&certificate.fiscal_code));
            println!("Document serial: {}", field(&certificate.doc_serial_number));
        }
    }
}

fn print_internal_auth(bundle: &InternalAuthResult, encoding: Encoding) {
    println!("NIS: {}", encoding.encode(&bundle.nis));
    println!("Public key: {}", encoding.encode(&bundle.public_key));
    println!("SOD: {}", encoding.encode(&bundle.sod));
    println!("Signed challenge: {}", encoding.encode(&bundle.signed_challenge));
}

fn print_mrtd(mrtd: &MrtdResult, encoding: Encoding) {
    println!("DG1: {}", encoding.encode(&mrtd.dg1));
    println!("DG11: {}", encoding.encode(&mrtd.dg11));
    println!("SOD: {}", encoding.encode(&mrtd.sod));
}
