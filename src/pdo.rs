//! PDO mapping setup and the cyclic process data exchange.
//!
//! Mapped objects are addressed by name afterwards, so a control loop reads
//! "position" and writes "target_torque" without carrying object dictionary
//! addresses around. Names are normalised to lowercase with underscores.

use std::collections::BTreeMap;

use log::info;

use crate::ectypes::{EcType, EcValue};
use crate::error::{FieldbusError, FieldbusResult};
use crate::fieldbus::{EcNode, RegisterTransport};

/// Object dictionary bases for the PDO mapping and communication
/// parameters. The n-th PDO lives at base + n - 1.
const TPDO_MAP_BASE: u16 = 0x1A00;
const RPDO_MAP_BASE: u16 = 0x1600;
const TPDO_COMM_BASE: u16 = 0x1800;
const RPDO_COMM_BASE: u16 = 0x1400;

/// Communication parameter subindices.
const COMM_TRANS_TYPE: u8 = 2;
const COMM_EVENT_TIMER: u8 = 5;

/// One object inside a PDO mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdoObject {
    pub name: String,
    pub index: u16,
    pub subindex: u8,
    pub ty: EcType,
}

impl PdoObject {
    pub fn new(name: &str, index: u16, subindex: u8, ty: EcType) -> Self {
        Self {
            name: name.to_string(),
            index,
            subindex,
            ty,
        }
    }

    /// The packed mapping entry as it goes into the object dictionary.
    fn mapping_entry(&self) -> u32 {
        (u32::from(self.index) << 16)
            | (u32::from(self.subindex) << 8)
            | self.ty.bit_size() as u32
    }
}

/// The PDO layout of one slave, kept so the cyclic exchange knows how to
/// pack and unpack the process data image.
#[derive(Debug, Default)]
pub struct PdoMapping {
    pub(crate) tx: Vec<PdoObject>,
    pub(crate) rx: Vec<PdoObject>,
    /// Last value written per RPDO entry. Entries not named in a cycle
    /// keep their previous value on the wire.
    pub(crate) rx_values: Vec<EcValue>,
}

fn normalize(name: &str) -> String {
    name.to_lowercase().split_whitespace().collect::<Vec<_>>().join("_")
}

fn default_value(ty: EcType) -> EcValue {
    if ty == EcType::F32 {
        EcValue::Float(0.0)
    } else if ty.signed() {
        EcValue::Signed(0)
    } else {
        EcValue::Unsigned(0)
    }
}

impl<T: RegisterTransport> EcNode<T> {
    /// Map a transmit PDO (slave to master) and enable it.
    pub fn setup_tpdo(
        &mut self,
        slave: u32,
        pdo_index: u8,
        objects: Vec<PdoObject>,
        trans_type: u8,
        event_timer: Option<u16>,
    ) -> FieldbusResult<(), T::Error> {
        let offset = pdo_offset(pdo_index)?;
        self.configure_pdo(
            slave,
            TPDO_MAP_BASE + offset,
            TPDO_COMM_BASE + offset,
            &objects,
            trans_type,
            event_timer,
        )?;
        let objects = normalized(objects);
        info!("slave {slave}: TPDO {pdo_index} maps {} object(s)", objects.len());
        self.pdo.entry(slave).or_default().tx = objects;
        Ok(())
    }

    /// Map a receive PDO (master to slave) and enable it.
    pub fn setup_rpdo(
        &mut self,
        slave: u32,
        pdo_index: u8,
        objects: Vec<PdoObject>,
        trans_type: u8,
        event_timer: Option<u16>,
    ) -> FieldbusResult<(), T::Error> {
        let offset = pdo_offset(pdo_index)?;
        self.configure_pdo(
            slave,
            RPDO_MAP_BASE + offset,
            RPDO_COMM_BASE + offset,
            &objects,
            trans_type,
            event_timer,
        )?;
        let objects = normalized(objects);
        info!("slave {slave}: RPDO {pdo_index} maps {} object(s)", objects.len());
        let mapping = self.pdo.entry(slave).or_default();
        mapping.rx_values = objects.iter().map(|obj| default_value(obj.ty)).collect();
        mapping.rx = objects;
        Ok(())
    }

    /// Clear, fill and re-enable one PDO mapping in the object dictionary.
    fn configure_pdo(
        &mut self,
        slave: u32,
        map_index: u16,
        comm_index: u16,
        objects: &[PdoObject],
        trans_type: u8,
        event_timer: Option<u16>,
    ) -> FieldbusResult<(), T::Error> {
        // Disable the mapping before touching the entries.
        self.sdo_download_raw(slave, map_index, 0, &[0])?;
        for (n, object) in objects.iter().enumerate() {
            self.sdo_download_raw(
                slave,
                map_index,
                n as u8 + 1,
                &object.mapping_entry().to_le_bytes(),
            )?;
        }
        self.sdo_download_raw(slave, map_index, 0, &[objects.len() as u8])?;

        self.sdo_download_raw(slave, comm_index, COMM_TRANS_TYPE, &[trans_type])?;
        if let Some(timer) = event_timer {
            self.sdo_download_raw(slave, comm_index, COMM_EVENT_TIMER, &timer.to_le_bytes())?;
        }
        Ok(())
    }

    /// One process data cycle.
    ///
    /// `writes` names RPDO entries to update; everything else keeps its
    /// previous value. The result holds every mapped TPDO entry by name.
    pub fn exchange_pdo(
        &mut self,
        slave: u32,
        writes: &[(&str, EcValue)],
    ) -> FieldbusResult<BTreeMap<String, EcValue>, T::Error> {
        let mapping = self.pdo.get_mut(&slave).ok_or(FieldbusError::NoPdoMapping)?;

        // Validate every name before anything goes on the wire.
        for (name, value) in writes {
            let key = normalize(name);
            let position = mapping
                .rx
                .iter()
                .position(|object| object.name == key)
                .ok_or_else(|| FieldbusError::UnknownRpdo(name.to_string()))?;
            mapping.rx_values[position] = *value;
        }

        let mut outputs = Vec::new();
        for (object, value) in mapping.rx.iter().zip(&mapping.rx_values) {
            let encoded = value
                .encode(object.ty)
                .ok_or(FieldbusError::Encode(*value, object.ty))?;
            outputs.extend_from_slice(&encoded);
        }

        let inputs = self
            .transport
            .pdo_exchange(slave, &outputs)
            .map_err(FieldbusError::Transport)?;

        let mut values = BTreeMap::new();
        let mut cursor = 0;
        for object in &mapping.tx {
            let size = object.ty.byte_size();
            let value = inputs
                .get(cursor..cursor + size)
                .and_then(|bytes| EcValue::decode(object.ty, bytes))
                .ok_or_else(|| FieldbusError::Parse {
                    what: "process data image",
                    text: format!("{inputs:02X?}"),
                })?;
            values.insert(object.name.clone(), value);
            cursor += size;
        }
        Ok(values)
    }
}

fn pdo_offset<E: core::fmt::Debug + core::fmt::Display>(
    pdo_index: u8,
) -> FieldbusResult<u16, E> {
    if pdo_index == 0 {
        return Err(FieldbusError::InvalidPdoIndex(0));
    }
    Ok(u16::from(pdo_index) - 1)
}

fn normalized(mut objects: Vec<PdoObject>) -> Vec<PdoObject> {
    for object in &mut objects {
        object.name = normalize(&object.name);
    }
    objects
}
