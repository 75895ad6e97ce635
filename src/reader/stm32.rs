//! Reader implementation for STM32 chain boards
//!
//! Each handler plans one command as a sequence of packet exchanges
//! over the owned link, translating every failure into a structured
//! event instead of an error return: the dispatcher thread must keep
//! running no matter what the chain does.
//!
//! Failure policy per command, matching the platform's taxonomy:
//! transport timeouts are ERRORs that abort the current device,
//! corrupt or unexpected responses are WARNINGs that skip the current
//! block, and precondition violations abort the handler before any
//! packet is sent.

use super::{HandlerCtx, Outcome, Reader};
use crate::bus::CommandRecord;
use crate::chain::{ChainTable, Device};
use crate::error::Error;
use crate::packet::{
    Command, Packet, BROADCAST_UID, DATA_SIZE, OUTPUT_BLOCKS, PING_ALL, SENSORS_ALL,
};
use crate::store::{SampleRecord, SensorRecord};
use crate::transport::Link;
use chrono::Utc;
use serde_json::json;
use std::time::Duration;

/// Reader for STM32 boards (Nucleo and Discovery families share the
/// line layer and differ only in `board_kind` and block count).
pub struct Stm32Reader<L: Link> {
    board_kind: String,
    link: L,
    table: ChainTable,
    receive_timeout: Duration,
}

impl<L: Link> Stm32Reader<L> {
    pub fn new(board_kind: &str, link: L, receive_timeout: Duration) -> Self {
        Stm32Reader {
            board_kind: board_kind.to_string(),
            link,
            table: ChainTable::new(),
            receive_timeout,
        }
    }

    /// Managed devices, pic order.
    pub fn devices(&self) -> &[Device] {
        self.table.list()
    }

    #[cfg(test)]
    pub fn link(&self) -> &L {
        &self.link
    }

    #[cfg(test)]
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    // ========================================================================
    // Preconditions
    // ========================================================================

    fn require_powered(&self, ctx: &mut HandlerCtx<'_>) -> bool {
        if !self.link.powered() {
            ctx.logbook
                .error(&format!("Port {} is powered off", self.link.label()));
            return false;
        }
        true
    }

    fn require_devices(&self, ctx: &mut HandlerCtx<'_>) -> bool {
        if self.table.is_empty() {
            ctx.logbook.error("No devices managed");
            return false;
        }
        true
    }

    fn managed_device(&self, uid: &str, ctx: &mut HandlerCtx<'_>) -> Option<Device> {
        match self.table.get(uid) {
            Some(device) => Some(device.clone()),
            None => {
                ctx.logbook
                    .error(&format!("Device {} is not managed", uid));
                None
            }
        }
    }

    fn device_param(cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Option<String> {
        match cmd.get("device").and_then(|v| v.as_str()) {
            Some(uid) => Some(uid.to_string()),
            None => {
                ctx.logbook.error("Command is missing field device");
                None
            }
        }
    }

    // ========================================================================
    // Exchanges
    // ========================================================================

    fn craft(command: Command, uid: &str, options: u32) -> Packet {
        let mut pkt = Packet::new();
        pkt.set_command(command);
        pkt.set_pic(0);
        pkt.set_uid(uid);
        pkt.set_options(options);
        pkt.finalize();
        pkt
    }

    /// One send/receive round trip with the per-command deadline.
    fn exchange(&mut self, packet: &Packet) -> Result<Packet, Error> {
        self.link.send(packet)?;
        self.link.receive(self.receive_timeout)
    }

    /// Validate a response: CRC intact, `ACK`, and from the expected
    /// device. Emits the per-case WARNING and reports usability.
    fn usable_ack(&self, response: &Packet, uid: &str, ctx: &mut HandlerCtx<'_>) -> bool {
        if !response.checksum_valid() || response.command() == Some(Command::Err) {
            ctx.logbook
                .warning(&format!("Packet from device {} is corrupted", uid));
            return false;
        }
        if response.command() != Some(Command::Ack) || response.uid() != uid {
            ctx.logbook
                .warning(&format!("Unexpected response from device {}", uid));
            return false;
        }
        true
    }

    /// Write one block and wait for its acknowledgement. Shared by
    /// `write` and `write_invert`.
    fn write_block(
        &mut self,
        device: &Device,
        offset: u32,
        data: &[u8],
        ctx: &mut HandlerCtx<'_>,
    ) -> Result<bool, ()> {
        let mut pkt = Self::craft(Command::Write, &device.uid, offset);
        pkt.set_data(data);
        pkt.finalize();

        match self.exchange(&pkt) {
            Ok(response) => Ok(self.usable_ack(&response, &device.uid, ctx)),
            Err(Error::TimedOut) => {
                ctx.logbook.error(&format!(
                    "Timeout writing memory of device {}",
                    device.uid
                ));
                Err(())
            }
            Err(e) => {
                ctx.logbook
                    .error(&format!("Transport failure on {}: {}", self.link.label(), e));
                Err(())
            }
        }
    }
}

impl<L: Link> Reader for Stm32Reader<L> {
    fn board_kind(&self) -> &str {
        &self.board_kind
    }

    fn handle_power_on(&mut self, _cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Outcome {
        match self.link.power_on() {
            Ok(()) => {
                ctx.logbook.info("Port powered on");
                Outcome::ok()
            }
            Err(e) => {
                log::warn!("Power on failed on {}: {}", self.link.label(), e);
                ctx.logbook.warning("Could not power on port");
                Outcome::error()
            }
        }
    }

    fn handle_power_off(&mut self, _cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Outcome {
        match self.link.power_off() {
            Ok(()) => {
                ctx.logbook.info("Port powered off");
                Outcome::ok()
            }
            Err(e) => {
                log::warn!("Power off failed on {}: {}", self.link.label(), e);
                ctx.logbook.warning("Could not power off port");
                Outcome::error()
            }
        }
    }

    fn handle_status(&mut self, _cmd: &CommandRecord, _ctx: &mut HandlerCtx<'_>) -> Outcome {
        let devices: Vec<_> = self
            .table
            .list()
            .iter()
            .map(|d| json!({"uid": d.uid, "pic": d.pic, "sram_size": d.sram_size}))
            .collect();
        Outcome::ok_with(json!({
            "state": if self.link.powered() { "ON" } else { "OFF" },
            "devices": devices,
        }))
    }

    fn handle_ping(&mut self, _cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Outcome {
        if !self.require_powered(ctx) {
            return Outcome::error();
        }

        let had_devices = !self.table.is_empty();
        self.table.clear();

        let mut pkt = Packet::new();
        pkt.set_command(Command::Ping);
        pkt.set_options(PING_ALL);
        pkt.set_pic(0);
        pkt.set_uid_raw(BROADCAST_UID);
        pkt.finalize();

        if let Err(e) = self.link.send(&pkt) {
            ctx.logbook
                .error(&format!("Transport failure on {}: {}", self.link.label(), e));
            return Outcome::error();
        }

        // The station does not ask each node; it listens until the
        // chain goes quiet. Each ACK's pic carries the responder's
        // distance from the station.
        loop {
            match self.link.receive(self.receive_timeout) {
                Ok(response) => {
                    if !response.checksum_valid() || response.command() != Some(Command::Ack) {
                        ctx.logbook.warning(&format!(
                            "Packet from device {} is corrupted",
                            response.uid()
                        ));
                        continue;
                    }
                    let device = Device {
                        uid: response.uid(),
                        pic: response.pic(),
                        sram_size: response.options(),
                        last_seen: Utc::now(),
                    };
                    let uid = device.uid.clone();
                    if let Some(collision) = self.table.upsert(device) {
                        ctx.logbook.warning(&format!(
                            "Device {} announced twice; keeping position {} over {}",
                            uid, collision.kept, collision.dropped
                        ));
                    }
                }
                Err(Error::TimedOut) => break,
                Err(e) => {
                    ctx.logbook
                        .error(&format!("Transport failure on {}: {}", self.link.label(), e));
                    return Outcome::error();
                }
            }
        }

        if self.table.is_empty() {
            if had_devices {
                ctx.logbook
                    .error("Devices were connected but now none could be identified");
            } else {
                ctx.logbook.error("No devices could be identified");
            }
            return Outcome::error();
        }

        ctx.logbook.info("Devices identified correctly");
        let devices: Vec<_> = self
            .table
            .list()
            .iter()
            .map(|d| json!({"uid": d.uid, "pic": d.pic, "sram_size": d.sram_size}))
            .collect();
        Outcome::ok_with(json!(devices))
    }

    fn handle_read(&mut self, _cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Outcome {
        if !self.require_powered(ctx) || !self.require_devices(ctx) {
            return Outcome::error();
        }

        let devices = self.table.list().to_vec();
        let mut samples = 0u32;

        for device in &devices {
            let blocks = device.sram_size / DATA_SIZE as u32;
            for offset in 0..blocks {
                let pkt = Self::craft(Command::Read, &device.uid, offset);
                match self.exchange(&pkt) {
                    Ok(response) => {
                        if !self.usable_ack(&response, &device.uid, ctx) {
                            // Corruption costs one block, not the dump.
                            continue;
                        }
                        let record = SampleRecord {
                            uid: device.uid.clone(),
                            board_kind: self.board_kind.clone(),
                            pic: device.pic,
                            block_offset: offset,
                            payload: response.data().to_vec(),
                            captured_at: Utc::now(),
                        };
                        if let Err(e) = ctx.store.append_sample(&record) {
                            log::warn!("Sample store rejected a record: {}", e);
                        }
                        samples += 1;
                        self.table.touch(&device.uid);
                    }
                    Err(Error::TimedOut) => {
                        ctx.logbook.error(&format!(
                            "Timeout reading memory of device {}",
                            device.uid
                        ));
                        break;
                    }
                    Err(e) => {
                        ctx.logbook.error(&format!(
                            "Transport failure on {}: {}",
                            self.link.label(),
                            e
                        ));
                        return Outcome::error();
                    }
                }
            }
        }

        ctx.logbook.info("Memory read correctly");
        Outcome::ok_with(json!({"samples": samples}))
    }

    fn handle_write(&mut self, cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Outcome {
        if !self.require_powered(ctx) || !self.require_devices(ctx) {
            return Outcome::error();
        }
        let Some(uid) = Self::device_param(cmd, ctx) else {
            return Outcome::error();
        };
        let Some(device) = self.managed_device(&uid, ctx) else {
            return Outcome::error();
        };

        let Some(offset) = cmd.get("offset").and_then(|v| v.as_u64()) else {
            ctx.logbook.error("Command is missing field offset");
            return Outcome::error();
        };
        let max_offset = device.sram_size / DATA_SIZE as u32;
        if offset >= max_offset as u64 {
            ctx.logbook.error(&format!(
                "Offset {} for device {} must be in range [0, {})",
                offset, uid, max_offset
            ));
            return Outcome::error();
        }

        let Some(values) = cmd.get("data").and_then(|v| v.as_array()) else {
            ctx.logbook.error("Command is missing field data");
            return Outcome::error();
        };
        if values.len() != DATA_SIZE {
            ctx.logbook.error(&format!(
                "Data for device {} must be exactly {} bytes",
                uid, DATA_SIZE
            ));
            return Outcome::error();
        }
        let mut data = Vec::with_capacity(DATA_SIZE);
        for value in values {
            match value.as_u64() {
                Some(b) if b <= 0xFF => data.push(b as u8),
                _ => {
                    ctx.logbook.error(&format!(
                        "Data for device {} must be bytes in range [0, 255]",
                        uid
                    ));
                    return Outcome::error();
                }
            }
        }

        match self.write_block(&device, offset as u32, &data, ctx) {
            Ok(true) => {
                self.table.touch(&uid);
                ctx.logbook.info("Data written correctly");
                Outcome::ok()
            }
            Ok(false) => Outcome::error(),
            Err(()) => Outcome::error(),
        }
    }

    fn handle_write_invert(&mut self, _cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Outcome {
        if !self.require_powered(ctx) || !self.require_devices(ctx) {
            return Outcome::error();
        }

        let devices = self.table.list().to_vec();
        let mut blocks_written = 0u32;

        // Half the chain keeps its power-on state as a control group:
        // only devices at even positions of the ordered table get their
        // reference dump written back inverted.
        for device in devices.iter().step_by(2) {
            let blocks = device.sram_size / DATA_SIZE as u32;
            let reference = match ctx.store.reference_dump(&device.uid, blocks) {
                Ok(reference) => reference,
                Err(e) => {
                    log::warn!("Reference query failed for {}: {}", device.uid, e);
                    continue;
                }
            };

            if reference.is_empty() {
                ctx.logbook.warning(&format!(
                    "At least one full memory sample has to be read from device {}",
                    device.uid
                ));
                continue;
            }
            if reference.len() < blocks as usize {
                ctx.logbook.warning(&format!(
                    "Reference dump for device {} is incomplete",
                    device.uid
                ));
                continue;
            }

            for sample in &reference {
                let inverted: Vec<u8> = sample.payload.iter().map(|b| !b).collect();
                match self.write_block(device, sample.block_offset, &inverted, ctx) {
                    Ok(true) => blocks_written += 1,
                    Ok(false) => continue,
                    Err(()) => break,
                }
            }
            self.table.touch(&device.uid);
        }

        ctx.logbook.info("Data inverted correctly");
        Outcome::ok_with(json!({"blocks": blocks_written}))
    }

    fn handle_sensors(&mut self, _cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Outcome {
        if !self.require_powered(ctx) || !self.require_devices(ctx) {
            return Outcome::error();
        }

        let devices = self.table.list().to_vec();
        let mut readings = Vec::new();

        for device in &devices {
            let pkt = Self::craft(Command::Sensors, &device.uid, SENSORS_ALL);
            let response = match self.exchange(&pkt) {
                Ok(response) => response,
                Err(Error::TimedOut) => {
                    ctx.logbook.error(&format!(
                        "Problem reading sensors for device {}",
                        device.uid
                    ));
                    continue;
                }
                Err(e) => {
                    ctx.logbook
                        .error(&format!("Transport failure on {}: {}", self.link.label(), e));
                    return Outcome::error();
                }
            };
            if !self.usable_ack(&response, &device.uid, ctx) {
                continue;
            }

            let d = response.data();
            let word = |i: usize| u16::from_le_bytes([d[2 * i], d[2 * i + 1]]);
            let record = SensorRecord {
                uid: device.uid.clone(),
                board_kind: self.board_kind.clone(),
                temp110_cal: word(0),
                temp30_cal: word(1),
                temperature_raw: word(2),
                vdd_cal: word(3),
                voltage_raw: word(4),
                captured_at: Utc::now(),
            };
            if record.temp110_cal == 0 || record.temp30_cal == 0 || record.vdd_cal == 0 {
                log::debug!("Calibration words missing for device {}", device.uid);
            }
            if let Err(e) = ctx.store.append_sensor(&record) {
                log::warn!("Sample store rejected a sensor record: {}", e);
            }
            self.table.touch(&device.uid);

            readings.push(json!({
                "uid": record.uid,
                "temperature_raw": record.temperature_raw,
                "voltage_raw": record.voltage_raw,
                "temperature": record.temperature_celsius(),
                "voltage": record.vdd_volts(),
            }));
        }

        ctx.logbook.info("Sensors read correctly");
        Outcome::ok_with(json!(readings))
    }

    fn handle_load(&mut self, cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Outcome {
        if !self.require_powered(ctx) || !self.require_devices(ctx) {
            return Outcome::error();
        }
        let Some(uid) = Self::device_param(cmd, ctx) else {
            return Outcome::error();
        };
        let Some(device) = self.managed_device(&uid, ctx) else {
            return Outcome::error();
        };
        let Some(source) = cmd.get("source").and_then(|v| v.as_str()) else {
            ctx.logbook.error("Command is missing field source");
            return Outcome::error();
        };
        let base = cmd.get("offset").and_then(|v| v.as_u64()).unwrap_or(0) as u32;

        let mut chunks = 0u32;
        for (index, chunk) in source.as_bytes().chunks(DATA_SIZE).enumerate() {
            let mut pkt = Self::craft(Command::Load, &device.uid, base + index as u32);
            pkt.set_data(chunk);
            pkt.finalize();

            match self.exchange(&pkt) {
                Ok(response) => {
                    if !self.usable_ack(&response, &device.uid, ctx) {
                        ctx.logbook
                            .error(&format!("Problem loading code for device {}", uid));
                        return Outcome::error();
                    }
                    chunks += 1;
                }
                Err(Error::TimedOut) => {
                    ctx.logbook
                        .error(&format!("Problem loading code for device {}", uid));
                    return Outcome::error();
                }
                Err(e) => {
                    ctx.logbook
                        .error(&format!("Transport failure on {}: {}", self.link.label(), e));
                    return Outcome::error();
                }
            }
        }

        self.table.touch(&uid);
        ctx.logbook
            .info(&format!("Code loaded on device {} correctly", uid));
        Outcome::ok_with(json!({"chunks": chunks}))
    }

    fn handle_exec(&mut self, cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Outcome {
        if !self.require_powered(ctx) || !self.require_devices(ctx) {
            return Outcome::error();
        }
        let Some(uid) = Self::device_param(cmd, ctx) else {
            return Outcome::error();
        };
        let Some(device) = self.managed_device(&uid, ctx) else {
            return Outcome::error();
        };
        let reset = cmd.get("reset").and_then(|v| v.as_bool()).unwrap_or(false);

        let pkt = Self::craft(Command::Exec, &device.uid, reset as u32);
        let response = match self.exchange(&pkt) {
            Ok(response) => response,
            Err(Error::TimedOut) => {
                ctx.logbook
                    .error(&format!("Problem executing code on device {}", uid));
                return Outcome::error();
            }
            Err(e) => {
                ctx.logbook
                    .error(&format!("Transport failure on {}: {}", self.link.label(), e));
                return Outcome::error();
            }
        };
        if !self.usable_ack(&response, &device.uid, ctx) {
            return Outcome::error();
        }

        self.table.touch(&uid);
        let code = response.options() as i32;
        if code == 0 {
            ctx.logbook
                .info(&format!("Code executed on device {} correctly", uid));
            Outcome::ok_with(json!({"code": 0}))
        } else {
            ctx.logbook.error(&format!(
                "Code on device {} executed with error code {}",
                uid, code
            ));
            Outcome::error_with(json!({"code": code}))
        }
    }

    fn handle_retrieve(&mut self, cmd: &CommandRecord, ctx: &mut HandlerCtx<'_>) -> Outcome {
        if !self.require_powered(ctx) || !self.require_devices(ctx) {
            return Outcome::error();
        }
        let Some(uid) = Self::device_param(cmd, ctx) else {
            return Outcome::error();
        };
        let Some(device) = self.managed_device(&uid, ctx) else {
            return Outcome::error();
        };

        let mut raw = Vec::with_capacity(OUTPUT_BLOCKS as usize * DATA_SIZE);
        for block in 0..OUTPUT_BLOCKS {
            let pkt = Self::craft(Command::Retr, &device.uid, block);
            match self.exchange(&pkt) {
                Ok(response) => {
                    if self.usable_ack(&response, &device.uid, ctx) {
                        raw.extend_from_slice(response.data());
                    }
                }
                Err(Error::TimedOut) => {
                    ctx.logbook.error(&format!(
                        "Problem retrieving results from device {}",
                        uid
                    ));
                    return Outcome::error();
                }
                Err(e) => {
                    ctx.logbook
                        .error(&format!("Transport failure on {}: {}", self.link.label(), e));
                    return Outcome::error();
                }
            }
        }

        // The output region holds i32 cells; trailing zeros are just
        // unwritten space.
        let mut integers: Vec<i32> = raw
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        while integers.last() == Some(&0) {
            integers.pop();
        }
        let text: String = integers
            .iter()
            .filter_map(|&n| {
                if n > 0 && n < 128 {
                    char::from_u32(n as u32)
                } else {
                    None
                }
            })
            .collect();

        self.table.touch(&uid);
        ctx.logbook.info(&format!(
            "Results retrieved correctly from device {}",
            uid
        ));
        Outcome::ok_with(json!({
            "raw": raw,
            "integers": integers,
            "text": text,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logbook::{EventRecord, Level, Logbook};
    use crate::node::{EchoInterpreter, Node, VirtualChain};
    use crate::packet::ERR_CHECKSUM_MISMATCH;
    use crate::store::MemoryStore;
    use crate::transport::MockLink;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Captured = Arc<Mutex<Vec<EventRecord>>>;

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn chain_reader(devices: &[(&str, u32)]) -> Stm32Reader<VirtualChain> {
        let mut chain = VirtualChain::new();
        for (uid, sram) in devices {
            chain.push_node(Node::new(uid, *sram, Box::new(EchoInterpreter)));
        }
        Stm32Reader::new("nucleo", chain, TIMEOUT)
    }

    fn record(fields: serde_json::Value) -> CommandRecord {
        fields.as_object().cloned().unwrap_or_default()
    }

    fn has_event(captured: &Captured, level: Level, message: &str) -> bool {
        captured
            .lock()
            .iter()
            .any(|r| r.level == level && r.message == message)
    }

    fn ack(uid: &str, pic: u8, options: u32) -> Packet {
        let mut pkt = Packet::new();
        pkt.set_command(Command::Ack);
        pkt.set_uid(uid);
        pkt.set_pic(pic);
        pkt.set_options(options);
        pkt.finalize();
        pkt
    }

    #[test]
    fn test_ping_discovers_single_device() {
        let uid = "A".repeat(25);
        let mut reader = chain_reader(&[(&uid, 16384)]);
        let (logbook, captured) = Logbook::capture("test");
        let mut store = MemoryStore::new();
        let mut ctx = HandlerCtx {
            logbook: &logbook,
            store: &mut store,
        };

        let outcome = reader.handle_ping(&record(json!({"command": "ping"})), &mut ctx);
        assert_eq!(outcome.status, crate::reader::Status::Ok);
        assert!(has_event(&captured, Level::Info, "Devices identified correctly"));

        let devices = reader.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].uid, uid);
        assert_eq!(devices[0].pic, 1);
        assert_eq!(devices[0].sram_size, 16384);
    }

    #[test]
    fn test_ping_orders_three_devices_by_position() {
        let mut reader = chain_reader(&[("X", 4096), ("Y", 4096), ("Z", 4096)]);
        let (logbook, _captured) = Logbook::capture("test");
        let mut store = MemoryStore::new();
        let mut ctx = HandlerCtx {
            logbook: &logbook,
            store: &mut store,
        };

        reader.handle_ping(&record(json!({})), &mut ctx);

        let listed: Vec<(String, u8)> = reader
            .devices()
            .iter()
            .map(|d| (d.uid.clone(), d.pic))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("X".to_string(), 1),
                ("Y".to_string(), 2),
                ("Z".to_string(), 3)
            ]
        );
    }

    #[test]
    fn test_ping_empty_chain_reports_no_devices() {
        let mut reader = chain_reader(&[]);
        let (logbook, captured) = Logbook::capture("test");
        let mut store = MemoryStore::new();
        let mut ctx = HandlerCtx {
            logbook: &logbook,
            store: &mut store,
        };

        let outcome = reader.handle_ping(&record(json!({})), &mut ctx);
        assert_eq!(outcome.status, crate::reader::Status::Error);
        assert!(has_event(&captured, Level::Error, "No devices could be identified"));
    }

    #[test]
    fn test_ping_lost_chain_reports_disappearance() {
        let link = MockLink::new();
        link.push_response(ack("X", 1, 4096));
        let mut reader = Stm32Reader::new("nucleo", link, TIMEOUT);
        let (logbook, captured) = Logbook::capture("test");
        let mut store = MemoryStore::new();
        let mut ctx = HandlerCtx {
            logbook: &logbook,
            store: &mut store,
        };

        reader.handle_ping(&record(json!({})), &mut ctx);
        assert_eq!(reader.devices().len(), 1);

        // Second discovery gets nothing back.
        let outcome = reader.handle_ping(&record(json!({})), &mut ctx);
        assert_eq!(outcome.status, crate::reader::Status::Error);
        assert!(has_event(
            &captured,
            Level::Error,
            "Devices were connected but now none could be identified"
        ));
        assert!(reader.devices().is_empty());
    }

    #[test]
    fn test_ping_duplicate_uid_keeps_lower_pic() {
        let link = MockLink::new();
        link.push_response(ack("X", 1, 4096));
        link.push_response(ack("X", 3, 4096));
        let mut reader = Stm32Reader::new("nucleo", link, TIMEOUT);
        let (logbook, captured) = Logbook::capture("test");
        let mut store = MemoryStore::new();
        let mut ctx = HandlerCtx {
            logbook: &logbook,
            store: &mut store,
        };

        reader.handle_ping(&record(json!({})), &mut ctx);
        assert_eq!(reader.devices()[0].pic, 1);
        assert!(has_event(
            &captured,
            Level::Warning,
            "Device X announced twice; keeping position 1 over 3"
        ));
    }

    #[test]
    fn test_read_requires_discovery_first() {
        let mut reader = chain_reader(&[("X", 4096)]);
        let (logbook, captured) = Logbook::capture("test");
        let mut store = MemoryStore::new();
        let mut ctx = HandlerCtx {
            logbook: &logbook,
            store: &mut store,
        };

        let outcome = reader.handle_read(&record(json!({})), &mut ctx);
        assert_eq!(outcome.status, crate::reader::Status::Error);
        assert!(has_event(&captured, Level::Error, "No devices managed"));
    }

    #[test]
    fn test_handlers_require_power() {
        let link = MockLink::new();
        link.set_powered(false);
        let mut reader = Stm32Reader::new("nucleo", link, TIMEOUT);
        let (logbook, captured) = Logbook::capture("test");
        let mut store = MemoryStore::new();
        let mut ctx = HandlerCtx {
            logbook: &logbook,
            store: &mut store,
        };

        let outcome = reader.handle_ping(&record(json!({})), &mut ctx);
        assert_eq!(outcome.status, crate::reader::Status::Error);
        assert!(has_event(&captured, Level::Error, "Port mock is powered off"));
        assert_eq!(reader.link().sent_count(), 0);
    }

    #[test]
    fn test_read_full_dump_matches_seeded_pattern() {
        let sram = 4 * DATA_SIZE as u32;
        let mut reader = chain_reader(&[("X", sram)]);
        for i in 0..4u32 {
            reader.link_mut().node_mut(0).sram_mut().fill_block(i, i as u8);
        }

        let (logbook, captured) = Logbook::capture("test");
        let mut store = MemoryStore::new();
        let mut ctx = HandlerCtx {
            logbook: &logbook,
            store: &mut store,
        };

        reader.handle_ping(&record(json!({})), &mut ctx);
        let outcome = reader.handle_read(&record(json!({})), &mut ctx);
        assert_eq!(outcome.status, crate::reader::Status::Ok);
        assert!(has_event(&captured, Level::Info, "Memory read correctly"));

        drop(ctx);
        assert_eq!(store.samples().len(), 4);
        for (i, sample) in store.samples().iter().enumerate() {
            assert_eq!(sample.block_offset, i as u32);
            assert_eq!(sample.uid, "X");
            assert_eq!(sample.pic, 1);
            assert!(sample.payload.iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let sram = 4 * DATA_SIZE as u32;
        let mut reader = chain_reader(&[("X", sram)]);
        let (logbook, captured) = Logbook::capture("test");
        let mut store = MemoryStore::new();
        let mut ctx = HandlerCtx {
            logbook: &logbook,
            store: &mut store,
        };

        reader.handle_ping(&record(json!({})), &mut ctx);

        let mut payload = vec![0u8; DATA_SIZE];
        payload[0] = 0xDE;
        payload[1] = 0xAD;
        let outcome = reader.handle_write(
            &record(json!({"device": "X", "offset": 2, "data": payload})),
            &mut ctx,
        );
        assert_eq!(outcome.status, crate::reader::Status::Ok);
        assert!(has_event(&captured, Level::Info, "Data written correctly"));

        reader.handle_read(&record(json!({})), &mut ctx);
        drop(ctx);
        let block2 = store
            .samples()
            .iter()
            .find(|s| s.block_offset == 2)
            .unwrap();
        assert_eq!(block2.payload, payload);
    }

    #[test]
    fn test_write_rejects_bad_offset_and_length() {
        let sram = 4 * DATA_SIZE as u32;
        let mut reader = chain_reader(&[("X", sram)]);
        let (logbook, captured) = Logbook::capture("test");
        let mut store = MemoryStore::new();
        let mut ctx = HandlerCtx {
            logbook: &logbook,
            store: &mut store,
        };

        reader.handle_ping(&record(json!({})), &mut ctx);

        let outcome = reader.handle_write(
            &record(json!({"device": "X", "offset": 9, "data": vec![0u8; DATA_SIZE]})),
            &mut ctx,
        );
        assert_eq!(outcome.status, crate::reader::Status::Error);
        assert!(has_event(
            &captured,
            Level::Error,
            "Offset 9 for device X must be in range [0, 4)"
        ));

        let outcome = reader.handle_write(
            &record(json!({"device": "X", "offset": 0, "data": [1, 2, 3]})),
            &mut ctx,
        );
        assert_eq!(outcome.status, crate::reader::Status::Error);
        assert!(has_event(
            &captured,
            Level::Error,
            &format!("Data for device X must be exactly {} bytes", DATA_SIZE)
        ));
    }

    #[test]
    fn test_write_unknown_device_rejected() {
        let mut reader = chain_reader(&[("X", 4 * DATA_SIZE as u32)]);
        let (logbook, captured) = Logbook::capture("test");
        let mut store = MemoryStore::new();
        let mut ctx = HandlerCtx {
            logbook: &logbook,
            store: &mut store,
        };

        reader.handle_ping(&record(json!({})), &mut ctx);
        let outcome = reader.handle_write(
            &record(json!({"device": "NOPE", "offset": 0, "data": vec![0u8; DATA_SIZE]})),
            &mut ctx,
        );
        assert_eq!(outcome.status, crate::reader::Status::Error);
        assert!(has_event(&captured, Level::Error, "Device NOPE is not managed"));
    }

    #[test]
    fn test_corrupt_response_is_warned_and_skipped() {
        let link = MockLink::new();
        link.push_response(ack("Y", 1, DATA_SIZE as u32));
        let mut reader = Stm32Reader::new("nucleo", link, TIMEOUT);
        let (logbook, captured) = Logbook::capture("test");
        let mut store = MemoryStore::new();
        let mut ctx = HandlerCtx {
            logbook: &logbook,
            store: &mut store,
        };
        reader.handle_ping(&record(json!({})), &mut ctx);

        // The chain answers the single READ with a checksum-mismatch
        // error from the head node.
        let mut err = Packet::new();
        err.set_command(Command::Err);
        err.set_options(ERR_CHECKSUM_MISMATCH);
        err.set_pic(1);
        err.set_uid("Y");
        err.finalize();
        reader.link().push_response(err);

        let outcome = reader.handle_read(&record(json!({})), &mut ctx);
        assert_eq!(outcome.status, crate::reader::Status::Ok);
        assert!(has_event(
            &captured,
            Level::Warning,
            "Packet from device Y is corrupted"
        ));
        drop(ctx);
        assert!(store.samples().is_empty());
    }

    #[test]
    fn test_read_timeout_aborts_device() {
        let link = MockLink::new();
        link.push_response(ack("Y", 1, (4 * DATA_SIZE) as u32));
        let mut reader = Stm32Reader::new("nucleo", link, TIMEOUT);
        let (logbook, captured) = Logbook::capture("test");
        let mut store = MemoryStore::new();
        let mut ctx = HandlerCtx {
            logbook: &logbook,
            store: &mut store,
        };
        reader.handle_ping(&record(json!({})), &mut ctx);
        reader.link().clear_sent();

        // No responses scripted: the first block times out.
        let outcome = reader.handle_read(&record(json!({})), &mut ctx);
        assert_eq!(outcome.status, crate::reader::Status::Ok);
        assert!(has_event(
            &captured,
            Level::Error,
            "Timeout reading memory of device Y"
        ));
        // The device was abandoned after its first block.
        assert_eq!(reader.link().sent_count(), 1);
    }

    #[test]
    fn test_write_invert_requires_reference_dump() {
        let link = MockLink::new();
        link.push_response(ack("X", 1, (4 * DATA_SIZE) as u32));
        let mut reader = Stm32Reader::new("nucleo", link, TIMEOUT);
        let (logbook, captured) = Logbook::capture("test");
        let mut store = MemoryStore::new();
        let mut ctx = HandlerCtx {
            logbook: &logbook,
            store: &mut store,
        };
        reader.handle_ping(&record(json!({})), &mut ctx);
        reader.link().clear_sent();

        let outcome = reader.handle_write_invert(&record(json!({})), &mut ctx);
        assert_eq!(outcome.status, crate::reader::Status::Ok);
        assert!(has_event(
            &captured,
            Level::Warning,
            "At least one full memory sample has to be read from device X"
        ));
        // No WRITE traffic without a reference.
        assert_eq!(reader.link().sent_count(), 0);
    }

    #[test]
    fn test_write_invert_flips_reference_blocks() {
        let sram = 2 * DATA_SIZE as u32;
        let mut reader = chain_reader(&[("X", sram), ("Y", sram)]);
        let (logbook, _captured) = Logbook::capture("test");
        let mut store = MemoryStore::new();
        let mut ctx = HandlerCtx {
            logbook: &logbook,
            store: &mut store,
        };

        reader.handle_ping(&record(json!({})), &mut ctx);
        reader.handle_read(&record(json!({})), &mut ctx);

        let outcome = reader.handle_write_invert(&record(json!({})), &mut ctx);
        assert_eq!(outcome.status, crate::reader::Status::Ok);
        assert_eq!(
            outcome.response.unwrap().get("blocks").unwrap().as_u64(),
            Some(2)
        );

        drop(ctx);
        // X (even index) now holds the bitwise NOT of its reference;
        // Y (odd index) is untouched.
        let x_reference: Vec<&crate::store::SampleRecord> = store
            .samples()
            .iter()
            .filter(|s| s.uid == "X")
            .collect();
        let x_now = reader.link_mut().node_mut(0).sram_mut().read_block(0);
        let inverted: Vec<u8> = x_reference[0].payload.iter().map(|b| !b).collect();
        assert_eq!(x_now.to_vec(), inverted);

        let y_reference: Vec<&crate::store::SampleRecord> = store
            .samples()
            .iter()
            .filter(|s| s.uid == "Y")
            .collect();
        let y_now = reader.link_mut().node_mut(1).sram_mut().read_block(0);
        assert_eq!(y_now.to_vec(), y_reference[0].payload);
    }

    #[test]
    fn test_sensors_records_raw_words() {
        let mut reader = chain_reader(&[("X", 4 * DATA_SIZE as u32)]);
        reader
            .link_mut()
            .node_mut(0)
            .set_sensors(crate::node::SensorBlock {
                temp_raw: 900,
                vdd_raw: 1650,
                temp30_cal: 800,
                temp110_cal: 1200,
                vdd_cal: 1500,
            });
        let (logbook, captured) = Logbook::capture("test");
        let mut store = MemoryStore::new();
        let mut ctx = HandlerCtx {
            logbook: &logbook,
            store: &mut store,
        };

        reader.handle_ping(&record(json!({})), &mut ctx);
        let outcome = reader.handle_sensors(&record(json!({})), &mut ctx);
        assert_eq!(outcome.status, crate::reader::Status::Ok);
        assert!(has_event(&captured, Level::Info, "Sensors read correctly"));

        drop(ctx);
        assert_eq!(store.sensors().len(), 1);
        let record = &store.sensors()[0];
        assert_eq!(record.temperature_raw, 900);
        assert_eq!(record.voltage_raw, 1650);
        assert_eq!(record.temp30_cal, 800);
        assert_eq!(record.temp110_cal, 1200);
        assert_eq!(record.vdd_cal, 1500);
    }

    #[test]
    fn test_load_exec_retrieve_cycle() {
        let mut reader = chain_reader(&[("X", 4 * DATA_SIZE as u32)]);
        let (logbook, captured) = Logbook::capture("test");
        let mut store = MemoryStore::new();
        let mut ctx = HandlerCtx {
            logbook: &logbook,
            store: &mut store,
        };
        reader.handle_ping(&record(json!({})), &mut ctx);

        let outcome = reader.handle_load(
            &record(json!({"device": "X", "source": "72 105"})),
            &mut ctx,
        );
        assert_eq!(outcome.status, crate::reader::Status::Ok);
        assert!(has_event(
            &captured,
            Level::Info,
            "Code loaded on device X correctly"
        ));

        let outcome = reader.handle_exec(
            &record(json!({"device": "X", "reset": true})),
            &mut ctx,
        );
        assert_eq!(outcome.status, crate::reader::Status::Ok);
        assert!(has_event(
            &captured,
            Level::Info,
            "Code executed on device X correctly"
        ));

        let outcome = reader.handle_retrieve(&record(json!({"device": "X"})), &mut ctx);
        assert_eq!(outcome.status, crate::reader::Status::Ok);
        let response = outcome.response.unwrap();
        assert_eq!(
            response.get("integers").unwrap(),
            &json!([72, 105])
        );
        assert_eq!(response.get("text").unwrap(), &json!("Hi"));
    }

    #[test]
    fn test_exec_reports_interpreter_error_code() {
        let mut reader = chain_reader(&[("X", 4 * DATA_SIZE as u32)]);
        let (logbook, captured) = Logbook::capture("test");
        let mut store = MemoryStore::new();
        let mut ctx = HandlerCtx {
            logbook: &logbook,
            store: &mut store,
        };
        reader.handle_ping(&record(json!({})), &mut ctx);

        reader.handle_load(
            &record(json!({"device": "X", "source": "72 bogus"})),
            &mut ctx,
        );
        let outcome = reader.handle_exec(&record(json!({"device": "X"})), &mut ctx);
        assert_eq!(outcome.status, crate::reader::Status::Error);
        assert_eq!(outcome.response.unwrap().get("code").unwrap(), &json!(1));
        assert!(has_event(
            &captured,
            Level::Error,
            "Code on device X executed with error code 1"
        ));
    }

    #[test]
    fn test_status_reports_state_and_devices() {
        let mut reader = chain_reader(&[("X", 4096)]);
        let (logbook, _captured) = Logbook::capture("test");
        let mut store = MemoryStore::new();
        let mut ctx = HandlerCtx {
            logbook: &logbook,
            store: &mut store,
        };

        let outcome = reader.handle_status(&record(json!({})), &mut ctx);
        let response = outcome.response.unwrap();
        assert_eq!(response.get("state").unwrap(), &json!("ON"));
        assert_eq!(response.get("devices").unwrap(), &json!([]));

        reader.handle_ping(&record(json!({})), &mut ctx);
        reader.handle_power_off(&record(json!({})), &mut ctx);
        let outcome = reader.handle_status(&record(json!({})), &mut ctx);
        let response = outcome.response.unwrap();
        assert_eq!(response.get("state").unwrap(), &json!("OFF"));
        assert_eq!(
            response.get("devices").unwrap().as_array().unwrap().len(),
            1
        );
    }
}
