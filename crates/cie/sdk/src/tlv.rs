//! BER-TLV helpers over `iso7816_tlv`

use iso7816_tlv::ber::{Tag, Tlv, Value};

use crate::error::{ProtocolError, Result};

/// Build a tag from its encoded bytes, e.g. `[0x7F, 0x49]`
pub(crate) fn tag(bytes: &[u8]) -> Result<Tag> {
    if bytes.is_empty() || bytes.len() > 3 {
        return Err(ProtocolError::apdu("Invalid TLV tag length"));
    }
    let raw = bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    Ok(Tag::try_from(raw)?)
}

/// Primitive object
pub(crate) fn primitive(tag_bytes: &[u8], value: &[u8]) -> Result<Tlv> {
    Ok(Tlv::new(tag(tag_bytes)?, Value::Primitive(value.to_vec()))?)
}

/// Constructed object
pub(crate) fn constructed(tag_bytes: &[u8], children: Vec<Tlv>) -> Result<Tlv> {
    Ok(Tlv::new(tag(tag_bytes)?, Value::Constructed(children))?)
}

/// Parse exactly one object, rejecting trailing bytes
pub(crate) fn parse_single(data: &[u8], expected: &[u8]) -> Result<Tlv> {
    let (tlv, rest) = Tlv::parse(data);
    let tlv = tlv?;
    if !rest.is_empty() {
        return Err(ProtocolError::apdu("Trailing bytes after TLV"));
    }
    if tlv.tag() != &tag(expected)? {
        return Err(ProtocolError::apdu(format!(
            "Expected tag {}, got {}",
            hex::encode_upper(expected),
            hex::encode_upper(tlv.tag().to_bytes())
        )));
    }
    Ok(tlv)
}

/// Children of a constructed object
pub(crate) fn children(tlv: &Tlv) -> Result<&[Tlv]> {
    match tlv.value() {
        Value::Constructed(children) => Ok(children),
        Value::Primitive(_) => Err(ProtocolError::apdu("Expected constructed TLV")),
    }
}

/// Value of the first primitive child tagged `tag_bytes`
pub(crate) fn find_primitive<'a>(tlvs: &'a [Tlv], tag_bytes: &[u8]) -> Result<&'a [u8]> {
    let wanted = tag(tag_bytes)?;
    let found = tlvs
        .iter()
        .find(|tlv| tlv.tag() == &wanted)
        .ok_or_else(|| {
            ProtocolError::apdu(format!("Missing tag {}", hex::encode_upper(tag_bytes)))
        })?;
    match found.value() {
        Value::Primitive(value) => Ok(value),
        Value::Constructed(_) => Err(ProtocolError::apdu("Expected primitive TLV")),
    }
}

/// First constructed child tagged `tag_bytes`
pub(crate) fn find_constructed<'a>(tlvs: &'a [Tlv], tag_bytes: &[u8]) -> Result<&'a Tlv> {
    let wanted = tag(tag_bytes)?;
    tlvs.iter()
        .find(|tlv| tlv.tag() == &wanted && matches!(tlv.value(), Value::Constructed(_)))
        .ok_or_else(|| ProtocolError::apdu(format!("Missing tag {}", hex::encode_upper(tag_bytes))))
}

/// Sequence of concatenated objects
pub(crate) fn parse_all(data: &[u8]) -> Result<Vec<Tlv>> {
    let mut out = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let (tlv, next) = Tlv::parse(rest);
        out.push(tlv?);
        rest = next;
    }
    Ok(out)
}

/// Value of a `7C` dynamic authentication data object carrying one primitive child
pub(crate) fn dynamic_auth_data(data: &[u8], child: u8) -> Result<Vec<u8>> {
    let tlv = parse_single(data, &[0x7C])?;
    Ok(find_primitive(children(&tlv)?, &[child])?.to_vec())
}

/// Encode `7C { child value }`
pub(crate) fn encode_dynamic_auth_data(child: u8, value: &[u8]) -> Result<Vec<u8>> {
    let inner = if value.is_empty() {
        Vec::new()
    } else {
        vec![primitive(&[child], value)?]
    };
    Ok(constructed(&[0x7C], inner)?.to_vec())
}
