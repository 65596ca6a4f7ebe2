use thiserror::Error;
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::structures::{PcrSelectionList, PcrSlot};

#[derive(Error, Debug, PartialEq)]
pub enum PcrError {
    #[error("invalid PCR selection list specification `{0}`")]
    InvalidPcrSelectionString(String),
    #[error("invalid PCR bank `{0}`")]
    InvalidPcrBank(String),
    #[error("invalid PCR slot `{0}`")]
    InvalidPcrSlot(String),
    #[error(transparent)]
    TssEsapi(#[from] tss_esapi::Error),
}

pub type Result<T, E = PcrError> = core::result::Result<T, E>;

const SLOTS: [PcrSlot; 32] = [
    PcrSlot::Slot0,
    PcrSlot::Slot1,
    PcrSlot::Slot2,
    PcrSlot::Slot3,
    PcrSlot::Slot4,
    PcrSlot::Slot5,
    PcrSlot::Slot6,
    PcrSlot::Slot7,
    PcrSlot::Slot8,
    PcrSlot::Slot9,
    PcrSlot::Slot10,
    PcrSlot::Slot11,
    PcrSlot::Slot12,
    PcrSlot::Slot13,
    PcrSlot::Slot14,
    PcrSlot::Slot15,
    PcrSlot::Slot16,
    PcrSlot::Slot17,
    PcrSlot::Slot18,
    PcrSlot::Slot19,
    PcrSlot::Slot20,
    PcrSlot::Slot21,
    PcrSlot::Slot22,
    PcrSlot::Slot23,
    PcrSlot::Slot24,
    PcrSlot::Slot25,
    PcrSlot::Slot26,
    PcrSlot::Slot27,
    PcrSlot::Slot28,
    PcrSlot::Slot29,
    PcrSlot::Slot30,
    PcrSlot::Slot31,
];

fn parse_pcr_bank(bank: &str) -> Result<HashingAlgorithm> {
    match bank {
        "sha1" => Ok(HashingAlgorithm::Sha1),
        "sha256" => Ok(HashingAlgorithm::Sha256),
        _ => Err(PcrError::InvalidPcrBank(bank.to_string())),
    }
}

fn parse_slot(slot: &str) -> Result<PcrSlot> {
    slot.trim()
        .parse::<usize>()
        .ok()
        .and_then(|index| SLOTS.get(index).copied())
        .ok_or_else(|| PcrError::InvalidPcrSlot(slot.to_string()))
}

fn parse_slots(slots: &str) -> Result<Vec<PcrSlot>> {
    slots.split(',').map(parse_slot).collect()
}

/// Parses a `bank:slot,slot,...` expression such as `sha256:0,7`.
pub fn parse_pcr_selection_list(expression: &str) -> Result<PcrSelectionList> {
    let (bank, slots) = expression
        .split_once(':')
        .ok_or_else(|| PcrError::InvalidPcrSelectionString(expression.to_owned()))?;
    let hash_algorithm = parse_pcr_bank(bank)?;
    let slots = parse_slots(slots)?;
    let selections = PcrSelectionList::builder()
        .with_selection(hash_algorithm, slots.as_slice())
        .build()?;
    Ok(selections)
}
