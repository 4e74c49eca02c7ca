//! Poll-cycle orchestration and ownership of the last-known telemetry.

use std::time::Duration;

use crate::fault::FaultCounts;
use crate::protocol::{
    self, BasicInfo, CellVoltages, DeviceName, MosfetControl, ProductionDate, ProtectionStatus,
    SoftwareVersion,
};
use crate::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Byte-oriented request/response channel supplied by a collaborator.
///
/// `read_until` fills `buffer` with everything received before the
/// terminator byte, consumes the terminator without storing it, and returns
/// the byte count. A count of zero, a partial frame, or an `Err` are all
/// treated as a failed exchange by the session.
pub trait Transport {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize>;

    fn read_until(
        &mut self,
        terminator: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> std::io::Result<usize>;
}

/// Last-known decoded state of the pack.
///
/// Owned exclusively by the session and overwritten field-group by
/// field-group on each successful decode; a failed query leaves the
/// affected group at its previous value.
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Telemetry {
    pub total_voltage: f32,
    pub current: f32, // negative=discharging, positive=charging
    pub balance_capacity: f32,
    pub rated_capacity: f32,
    pub cycle_count: u16,
    pub production_date: ProductionDate,
    pub protection_status: ProtectionStatus,
    pub software_version: SoftwareVersion,
    pub state_of_charge: u8,
    pub charge_fet_enabled: bool,
    pub discharge_fet_enabled: bool,
    pub num_cells: u8,
    pub num_temperature_sensors: u8,
    pub temperatures: Vec<f32>,
    pub cell_voltages: Vec<f32>,
    pub balance_status: u32,
    /// Empty until the name query first succeeds.
    pub name: String,
}

impl Telemetry {
    fn apply_basic_info(&mut self, info: BasicInfo) {
        self.total_voltage = info.total_voltage;
        self.current = info.current;
        self.balance_capacity = info.balance_capacity;
        self.rated_capacity = info.rated_capacity;
        self.cycle_count = info.cycle_count;
        self.production_date = info.production_date;
        self.protection_status = info.protection_status;
        self.software_version = info.software_version;
        self.state_of_charge = info.state_of_charge;
        self.charge_fet_enabled = info.charge_fet_enabled;
        self.discharge_fet_enabled = info.discharge_fet_enabled;
        self.num_cells = info.num_cells;
        self.num_temperature_sensors = info.num_temperature_sensors;
        self.temperatures = info.temperatures;
        self.balance_status = info.balance_status;
    }

    /// Whether cell `cell` is currently balancing. False for any index at
    /// or beyond the reported cell count, or beyond the 32-bit mask.
    pub fn is_balancing(&self, cell: usize) -> bool {
        if cell >= 32 || cell >= usize::from(self.num_cells) {
            return false;
        }
        (self.balance_status >> cell) & 1 != 0
    }
}

struct Link<T> {
    transport: T,
    timeout: Duration,
}

impl<T: Transport> Link<T> {
    /// One blocking write followed by one blocking terminator-bounded read,
    /// validated before any byte is trusted.
    fn exchange(&mut self, request: &[u8], expected_command: u8) -> Result<Vec<u8>, Error> {
        log::trace!("send: {:02X?}", request);
        self.transport.write(request)?;

        let mut buffer = [0u8; protocol::RX_BUFFER_SIZE];
        let received = self
            .transport
            .read_until(protocol::STOP_BYTE, &mut buffer, self.timeout)?;
        log::trace!("receive: {:02X?}", &buffer[..received]);

        protocol::validate(&buffer, expected_command, received)?;
        Ok(buffer[..received].to_vec())
    }
}

/// Drives the query sequence against one BMS and owns the resulting state.
///
/// Starts disabled; polling is a no-op until a transport is attached with
/// [`BmsSession::start`].
pub struct BmsSession<T> {
    link: Option<Link<T>>,
    telemetry: Telemetry,
    last_protection_status: ProtectionStatus,
    fault_counts: FaultCounts,
    com_error: bool,
}

impl<T: Transport> BmsSession<T> {
    pub fn new() -> Self {
        Self {
            link: None,
            telemetry: Telemetry::default(),
            last_protection_status: ProtectionStatus::default(),
            fault_counts: FaultCounts::default(),
            com_error: false,
        }
    }

    /// Attach a transport and enable polling. `read_timeout` bounds every
    /// blocking read; total poll latency is bounded only through it.
    pub fn start(&mut self, transport: T, read_timeout: Duration) {
        self.link = Some(Link {
            transport,
            timeout: read_timeout,
        });
    }

    /// Disable polling and hand the transport back.
    pub fn stop(&mut self) -> Option<T> {
        self.link.take().map(|link| link.transport)
    }

    pub fn is_enabled(&self) -> bool {
        self.link.is_some()
    }

    /// Run one poll cycle: basic info, cell voltages, and - while the name
    /// is still unknown - the name query. Each exchange independently sets
    /// or clears the communication-error flag; a failure never aborts the
    /// remaining queries and never discards previously decoded state.
    pub fn poll(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };

        match link
            .exchange(&BasicInfo::request(), protocol::CMD_BASIC_SYSTEM_INFO)
            .and_then(|frame| BasicInfo::decode(&frame))
        {
            Ok(info) => {
                self.com_error = false;
                self.fault_counts = self
                    .fault_counts
                    .observe(self.last_protection_status, info.protection_status);
                self.last_protection_status = info.protection_status;
                self.telemetry.apply_basic_info(info);
            }
            Err(err) => {
                log::warn!("Basic info query failed: {err}");
                self.com_error = true;
            }
        }

        match link
            .exchange(&CellVoltages::request(), protocol::CMD_CELL_VOLTAGES)
            .and_then(|frame| CellVoltages::decode(&frame, self.telemetry.num_cells))
        {
            Ok(voltages) => {
                self.com_error = false;
                self.telemetry.cell_voltages = voltages;
            }
            Err(err) => {
                log::warn!("Cell voltage query failed: {err}");
                self.com_error = true;
            }
        }

        if self.telemetry.name.is_empty() {
            match link
                .exchange(&DeviceName::request(), protocol::CMD_NAME)
                .and_then(|frame| DeviceName::decode(&frame))
            {
                Ok(name) => {
                    self.com_error = false;
                    self.telemetry.name = name;
                }
                Err(err) => {
                    log::warn!("Name query failed: {err}");
                    self.com_error = true;
                }
            }
        }
    }

    /// Gate the charge and discharge MOSFETs. No-op while disabled.
    pub fn set_mosfet_control(&mut self, charge: bool, discharge: bool) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        match link.exchange(
            &MosfetControl::request(charge, discharge),
            protocol::CMD_CTL_MOSFET,
        ) {
            Ok(_) => self.com_error = false,
            Err(err) => {
                log::warn!("MOSFET control command failed: {err}");
                self.com_error = true;
            }
        }
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn fault_counts(&self) -> FaultCounts {
        self.fault_counts
    }

    pub fn clear_fault_counts(&mut self) {
        self.fault_counts.clear();
    }

    /// True iff the most recent exchange failed validation.
    pub fn has_communication_error(&self) -> bool {
        self.com_error
    }

    pub fn is_balancing(&self, cell: usize) -> bool {
        self.telemetry.is_balancing(cell)
    }
}

impl<T: Transport> Default for BmsSession<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        checksum, CMD_BASIC_SYSTEM_INFO, CMD_CELL_VOLTAGES, CMD_CTL_MOSFET, CMD_NAME, START_BYTE,
        STOP_BYTE,
    };
    use std::collections::VecDeque;

    const TIMEOUT: Duration = Duration::from_millis(100);

    /// Scripted transport: each queued entry answers one exchange, `None`
    /// simulating a read timeout.
    struct MockTransport {
        responses: VecDeque<Option<Vec<u8>>>,
        written: Vec<Vec<u8>>,
    }

    impl MockTransport {
        fn new(responses: Vec<Option<Vec<u8>>>) -> Self {
            Self {
                responses: responses.into(),
                written: Vec::new(),
            }
        }
    }

    impl Transport for MockTransport {
        fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
            self.written.push(bytes.to_vec());
            Ok(bytes.len())
        }

        fn read_until(
            &mut self,
            terminator: u8,
            buffer: &mut [u8],
            _timeout: Duration,
        ) -> std::io::Result<usize> {
            match self.responses.pop_front().flatten() {
                None => Ok(0),
                Some(frame) => {
                    let end = frame
                        .iter()
                        .position(|&b| b == terminator)
                        .unwrap_or(frame.len());
                    let n = end.min(buffer.len());
                    buffer[..n].copy_from_slice(&frame[..n]);
                    Ok(n)
                }
            }
        }
    }

    /// Complete wire frame, STOP terminator included.
    fn wire_frame(command: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![START_BYTE, command, 0x00, payload.len() as u8];
        frame.extend_from_slice(payload);
        let crc = checksum(&frame[2..]);
        frame.extend_from_slice(&crc.to_be_bytes());
        frame.push(STOP_BYTE);
        frame
    }

    fn basic_info_frame(protection: u16, balance_low: u16, num_cells: u8) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&0x1700u16.to_be_bytes());
        p.extend_from_slice(&200i16.to_be_bytes());
        p.extend_from_slice(&8000u16.to_be_bytes());
        p.extend_from_slice(&10000u16.to_be_bytes());
        p.extend_from_slice(&42u16.to_be_bytes());
        p.extend_from_slice(&0x2068u16.to_be_bytes());
        p.extend_from_slice(&balance_low.to_be_bytes());
        p.extend_from_slice(&0u16.to_be_bytes()); // balance high half
        p.extend_from_slice(&protection.to_be_bytes());
        p.push(0x10);
        p.push(76);
        p.push(0b11);
        p.push(num_cells);
        p.push(2);
        p.extend_from_slice(&2982u16.to_be_bytes());
        p.extend_from_slice(&2951u16.to_be_bytes());
        wire_frame(CMD_BASIC_SYSTEM_INFO, &p)
    }

    fn voltages_frame(count: usize) -> Vec<u8> {
        let mut p = Vec::new();
        for i in 0..count {
            p.extend_from_slice(&(3300 + i as u16).to_be_bytes());
        }
        wire_frame(CMD_CELL_VOLTAGES, &p)
    }

    fn name_frame(name: &str) -> Vec<u8> {
        wire_frame(CMD_NAME, name.as_bytes())
    }

    fn enabled_session(responses: Vec<Option<Vec<u8>>>) -> BmsSession<MockTransport> {
        let mut session = BmsSession::new();
        session.start(MockTransport::new(responses), TIMEOUT);
        session
    }

    #[test]
    fn poll_decodes_full_snapshot() {
        let mut session = enabled_session(vec![
            Some(basic_info_frame(0, 0, 4)),
            Some(voltages_frame(4)),
            Some(name_frame("0123456789")),
        ]);
        session.poll();

        let telemetry = session.telemetry();
        assert!((telemetry.total_voltage - 58.88).abs() < 1e-3);
        assert_eq!(telemetry.num_cells, 4);
        assert_eq!(telemetry.cell_voltages.len(), 4);
        assert_eq!(telemetry.name, "0123456789");
        assert!(!session.has_communication_error());

        let transport = session.stop().unwrap();
        assert_eq!(transport.written.len(), 3);
        assert_eq!(transport.written[0][2], CMD_BASIC_SYSTEM_INFO);
        assert_eq!(transport.written[1][2], CMD_CELL_VOLTAGES);
        assert_eq!(transport.written[2][2], CMD_NAME);
    }

    #[test]
    fn name_is_not_requeried_once_known() {
        let mut session = enabled_session(vec![
            Some(basic_info_frame(0, 0, 4)),
            Some(voltages_frame(4)),
            Some(name_frame("pack-1")),
            Some(basic_info_frame(0, 0, 4)),
            Some(voltages_frame(4)),
        ]);
        session.poll();
        session.poll();

        assert_eq!(session.telemetry().name, "pack-1");
        let transport = session.stop().unwrap();
        // Three queries on the first poll, two on the second.
        assert_eq!(transport.written.len(), 5);
    }

    #[test]
    fn empty_name_reply_keeps_the_query_alive() {
        let mut session = enabled_session(vec![
            Some(basic_info_frame(0, 0, 4)),
            Some(voltages_frame(4)),
            Some(name_frame("")),
            Some(basic_info_frame(0, 0, 4)),
            Some(voltages_frame(4)),
            Some(name_frame("pack-1")),
        ]);
        session.poll();
        assert_eq!(session.telemetry().name, "");
        session.poll();
        assert_eq!(session.telemetry().name, "pack-1");
    }

    #[test]
    fn failed_query_keeps_stale_values_and_raises_flag() {
        let mut session = enabled_session(vec![
            Some(basic_info_frame(0, 0, 4)),
            Some(voltages_frame(4)),
            Some(name_frame("pack-1")),
            // Second poll: basic info succeeds, cell voltages time out.
            Some(basic_info_frame(0, 0, 4)),
            None,
        ]);
        session.poll();
        let before = session.telemetry().cell_voltages.clone();
        assert!(!session.has_communication_error());

        session.poll();
        assert!(session.has_communication_error());
        assert_eq!(session.telemetry().cell_voltages, before);
        // The basic-info group was still refreshed by its own success.
        assert!((session.telemetry().total_voltage - 58.88).abs() < 1e-3);
    }

    #[test]
    fn later_success_clears_the_error_flag() {
        let mut session = enabled_session(vec![
            // Basic info times out, the remaining queries still run.
            None,
            Some(voltages_frame(4)),
            Some(name_frame("pack-1")),
        ]);
        session.poll();
        // The flag tracks the most recent exchange.
        assert!(!session.has_communication_error());
        let transport = session.stop().unwrap();
        assert_eq!(transport.written.len(), 3);
    }

    #[test]
    fn fault_edges_accumulate_across_polls() {
        // short_circuit bit (bit 10) over five polls: F T T F T -> 2 edges.
        let flags = [false, true, true, false, true];
        // The name resolves on the first poll, so only that poll consumes
        // three responses.
        let mut responses = vec![
            Some(basic_info_frame(0, 0, 4)),
            Some(voltages_frame(4)),
            Some(name_frame("pack-1")),
        ];
        for &on in &flags[1..] {
            responses.push(Some(basic_info_frame(if on { 1 << 10 } else { 0 }, 0, 4)));
            responses.push(Some(voltages_frame(4)));
        }
        let mut session = enabled_session(responses);
        for _ in 0..flags.len() {
            session.poll();
        }
        assert_eq!(session.fault_counts().short_circuit, 2);
        assert_eq!(session.fault_counts().single_cell_overvoltage, 0);
    }

    #[test]
    fn failed_poll_does_not_advance_fault_state() {
        let mut session = enabled_session(vec![
            Some(basic_info_frame(1 << 10, 0, 4)),
            Some(voltages_frame(4)),
            Some(name_frame("pack-1")),
            // Whole second poll times out: no new status to compare.
            None,
            None,
            // Third poll sees the flag still raised - no new edge.
            Some(basic_info_frame(1 << 10, 0, 4)),
            Some(voltages_frame(4)),
        ]);
        session.poll();
        assert_eq!(session.fault_counts().short_circuit, 1);
        session.poll();
        assert_eq!(session.fault_counts().short_circuit, 1);
        session.poll();
        assert_eq!(session.fault_counts().short_circuit, 1);
    }

    #[test]
    fn clear_fault_counts_resets_everything() {
        let mut session = enabled_session(vec![
            Some(basic_info_frame(1 << 10 | 1, 0, 4)),
            Some(voltages_frame(4)),
            Some(name_frame("pack-1")),
        ]);
        session.poll();
        assert_eq!(session.fault_counts().short_circuit, 1);
        assert_eq!(session.fault_counts().single_cell_overvoltage, 1);
        session.clear_fault_counts();
        assert_eq!(session.fault_counts(), FaultCounts::default());
    }

    #[test]
    fn balancing_predicate_is_bounded() {
        let mut session = enabled_session(vec![
            // Bits 2 and 5 set, 4 cells reported.
            Some(basic_info_frame(0, 0b0010_0100, 4)),
            Some(voltages_frame(4)),
            Some(name_frame("pack-1")),
        ]);
        session.poll();
        assert!(session.is_balancing(2));
        assert!(!session.is_balancing(0));
        // Bit 5 is set but beyond the reported cell count.
        assert!(!session.is_balancing(5));
        assert!(!session.is_balancing(32));
        assert!(!session.is_balancing(400));
    }

    #[test]
    fn disabled_session_does_nothing() {
        let mut session: BmsSession<MockTransport> = BmsSession::new();
        assert!(!session.is_enabled());
        session.poll();
        session.set_mosfet_control(true, true);
        assert_eq!(session.telemetry(), &Telemetry::default());

        session.start(MockTransport::new(vec![]), TIMEOUT);
        assert!(session.is_enabled());
        let transport = session.stop().unwrap();
        assert!(transport.written.is_empty());
        assert!(!session.is_enabled());
        session.poll(); // no-op again after stop
    }

    #[test]
    fn mosfet_control_exchange() {
        let mut session = enabled_session(vec![Some(wire_frame(CMD_CTL_MOSFET, &[]))]);
        session.set_mosfet_control(true, false);
        assert!(!session.has_communication_error());

        let transport = session.stop().unwrap();
        assert_eq!(transport.written.len(), 1);
        // Charge enable clears bit 0 only; discharge stays disabled.
        assert_eq!(transport.written[0][5], 0b10);
    }

    #[test]
    fn mosfet_control_timeout_raises_flag() {
        let mut session = enabled_session(vec![None]);
        session.set_mosfet_control(false, false);
        assert!(session.has_communication_error());
    }
}
