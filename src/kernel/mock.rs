//! In-memory network kernel for development and testing.
//!
//! Simulates bridges, bonds, VLANs, interface link state, the FDB, and
//! ARP, with configurable failure injection. Handles share interior
//! state, so a test can keep a clone and observe what genes did to the
//! live kernel; shadows start from fresh state.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::kernel::{arg_bool, arg_i64, arg_str, arg_str_list, Kernel, OpKind, OpSpec};
use crate::registry::unix_now;
use crate::topology::{resolve_value, ResourceMapper, TopologyAction, TopologyStep};
use crate::contract::TopologyResource;

#[derive(Debug, Clone, Serialize)]
struct BridgeState {
    name: String,
    interfaces: Vec<String>,
    stp_enabled: bool,
    forward_delay: i64,
}

#[derive(Debug, Clone, Serialize)]
struct BondState {
    name: String,
    mode: String,
    members: Vec<String>,
    active: bool,
}

#[derive(Debug, Clone, Serialize)]
struct VlanState {
    name: String,
    parent: String,
    vlan_id: i64,
}

#[derive(Debug, Clone, Serialize)]
struct InterfaceState {
    name: String,
    mac: String,
    carrier: bool,
    operstate: String,
    master: String,
}

#[derive(Debug, Clone, Serialize)]
struct FdbEntry {
    mac: String,
    port: String,
    vlan: i64,
    is_local: bool,
    #[serde(skip)]
    timestamp: f64,
}

#[derive(Debug, Default)]
struct NetState {
    bridges: BTreeMap<String, BridgeState>,
    bonds: BTreeMap<String, BondState>,
    vlans: BTreeMap<String, VlanState>,
    interfaces: BTreeMap<String, InterfaceState>,
    fdb: BTreeMap<String, Vec<FdbEntry>>,
    arp_table: Vec<(String, String, String)>,
    gratuitous_arps: Vec<(String, String)>,
    tracked: Vec<(String, String)>,
    injected_failures: BTreeMap<String, String>,
    fail_at: Option<u64>,
    mutation_count: u64,
}

const OPS: &[OpSpec] = &[
    OpSpec::mutating("create_bridge"),
    OpSpec::mutating_with_snapshot("delete_bridge"),
    OpSpec::mutating("attach_interface"),
    OpSpec::mutating("detach_interface"),
    OpSpec::read("get_bridge"),
    OpSpec::mutating_with_snapshot("set_stp"),
    OpSpec::read("get_stp_state"),
    OpSpec::read("get_device_mac"),
    OpSpec::mutating_with_snapshot("set_device_mac"),
    OpSpec::read("send_gratuitous_arp"),
    OpSpec::mutating("create_bond"),
    OpSpec::mutating_with_snapshot("delete_bond"),
    OpSpec::read("get_bond"),
    OpSpec::mutating("create_vlan"),
    OpSpec::mutating_with_snapshot("delete_vlan"),
    OpSpec::read("get_vlan"),
    OpSpec::read("read_fdb"),
    OpSpec::read("get_interface_state"),
    OpSpec::read("get_arp_table"),
    OpSpec::read("track_resource"),
    OpSpec::read("untrack_resource"),
];

/// Mock network kernel. Cloned handles share state.
#[derive(Clone)]
pub struct MockNetKernel {
    state: Arc<Mutex<NetState>>,
}

impl Default for MockNetKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNetKernel {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetState::default())),
        }
    }

    // --- Failure injection (test setup surface) ---

    /// Inject a one-shot failure for the named operation.
    pub fn inject_failure(&self, operation: &str, message: &str) {
        self.state
            .lock()
            .injected_failures
            .insert(operation.to_string(), message.to_string());
    }

    /// Fail on the Nth mutating operation (1-indexed) from now.
    pub fn fail_at_mutation(&self, n: u64) {
        let mut state = self.state.lock();
        state.fail_at = Some(n);
        state.mutation_count = 0;
    }

    /// Simulate a link going down.
    pub fn inject_link_failure(&self, interface: &str) {
        let mut state = self.state.lock();
        let iface = state
            .interfaces
            .entry(interface.to_string())
            .or_insert_with(|| InterfaceState {
                name: interface.to_string(),
                mac: generate_mac(interface),
                carrier: true,
                operstate: "up".into(),
                master: String::new(),
            });
        iface.carrier = false;
        iface.operstate = "down".into();
    }

    /// Inject MAC flapping: the same MAC shows up on several ports, so
    /// `read_fdb` reports it on all of them.
    pub fn inject_mac_flapping(&self, bridge: &str, mac: &str, ports: &[&str]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.bridges.contains_key(bridge) {
            return Err(Error::Kernel(format!("bridge '{bridge}' does not exist")));
        }
        let now = unix_now();
        let entries = state.fdb.entry(bridge.to_string()).or_default();
        for (i, port) in ports.iter().enumerate() {
            entries.push(FdbEntry {
                mac: mac.to_string(),
                port: (*port).to_string(),
                vlan: 0,
                is_local: false,
                timestamp: now + i as f64 * 0.001,
            });
        }
        Ok(())
    }

    /// Directly add an FDB entry (test setup).
    pub fn add_fdb_entry(&self, bridge: &str, mac: &str, port: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.bridges.contains_key(bridge) {
            return Err(Error::Kernel(format!("bridge '{bridge}' does not exist")));
        }
        state.fdb.entry(bridge.to_string()).or_default().push(FdbEntry {
            mac: mac.to_string(),
            port: port.to_string(),
            vlan: 0,
            is_local: false,
            timestamp: unix_now(),
        });
        Ok(())
    }

    /// Directly add an ARP entry (test setup).
    pub fn add_arp_entry(&self, ip: &str, mac: &str, device: &str) {
        self.state
            .lock()
            .arp_table
            .push((ip.to_string(), mac.to_string(), device.to_string()));
    }

    // --- Direct observation (test assertion surface) ---

    pub fn bridge(&self, name: &str) -> Option<Value> {
        let state = self.state.lock();
        state.bridges.get(name).map(to_value)
    }

    pub fn bond(&self, name: &str) -> Option<Value> {
        let state = self.state.lock();
        state.bonds.get(name).map(to_value)
    }

    pub fn vlan(&self, parent: &str, vlan_id: i64) -> Option<Value> {
        let state = self.state.lock();
        state.vlans.get(&format!("{parent}.{vlan_id}")).map(to_value)
    }

    pub fn device_mac(&self, device: &str) -> Option<String> {
        let state = self.state.lock();
        state.interfaces.get(device).map(|i| i.mac.clone())
    }

    pub fn gratuitous_arps(&self) -> Vec<(String, String)> {
        self.state.lock().gratuitous_arps.clone()
    }

    // --- Internal dispatch ---

    fn check_failure(&self, op: &str) -> Result<()> {
        if let Some(msg) = self.state.lock().injected_failures.remove(op) {
            return Err(Error::Kernel(msg));
        }
        Ok(())
    }

    fn check_mutation_budget(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_at.is_some() {
            state.mutation_count += 1;
            if state.mutation_count >= state.fail_at.unwrap() {
                state.fail_at = None;
                let count = state.mutation_count;
                return Err(Error::Kernel(format!(
                    "simulated failure at mutation #{count}"
                )));
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, op: &str, args: &[Value]) -> Result<Value> {
        match op {
            "create_bridge" => {
                let name = arg_str(op, args, 0)?;
                let interfaces = arg_str_list(op, args, 1)?;
                self.create_bridge(name, &interfaces)
            }
            "delete_bridge" => {
                let name = arg_str(op, args, 0)?;
                self.delete_bridge(name)?;
                Ok(Value::Null)
            }
            "attach_interface" => {
                let bridge = arg_str(op, args, 0)?;
                let interface = arg_str(op, args, 1)?;
                self.attach_interface(bridge, interface)?;
                Ok(Value::Null)
            }
            "detach_interface" => {
                let bridge = arg_str(op, args, 0)?;
                let interface = arg_str(op, args, 1)?;
                self.detach_interface(bridge, interface)?;
                Ok(Value::Null)
            }
            "get_bridge" => {
                let name = arg_str(op, args, 0)?;
                Ok(self.bridge(name).unwrap_or(Value::Null))
            }
            "set_stp" => {
                let bridge = arg_str(op, args, 0)?;
                let enabled = arg_bool(op, args, 1)?;
                let delay = arg_i64(op, args, 2)?;
                self.set_stp(bridge, enabled, delay)
            }
            "get_stp_state" => {
                let bridge = arg_str(op, args, 0)?;
                self.get_stp_state(bridge)
            }
            "get_device_mac" => {
                let device = arg_str(op, args, 0)?;
                let state = self.state.lock();
                let iface = state
                    .interfaces
                    .get(device)
                    .ok_or_else(|| Error::Kernel(format!("device '{device}' does not exist")))?;
                Ok(Value::String(iface.mac.clone()))
            }
            "set_device_mac" => {
                let device = arg_str(op, args, 0)?;
                let mac = arg_str(op, args, 1)?;
                let mut state = self.state.lock();
                let iface = state
                    .interfaces
                    .get_mut(device)
                    .ok_or_else(|| Error::Kernel(format!("device '{device}' does not exist")))?;
                iface.mac = mac.to_string();
                Ok(Value::Null)
            }
            "send_gratuitous_arp" => {
                let interface = arg_str(op, args, 0)?;
                let mac = arg_str(op, args, 1)?;
                self.state
                    .lock()
                    .gratuitous_arps
                    .push((interface.to_string(), mac.to_string()));
                Ok(Value::Null)
            }
            "create_bond" => {
                let name = arg_str(op, args, 0)?;
                let mode = arg_str(op, args, 1)?;
                let members = arg_str_list(op, args, 2)?;
                self.create_bond(name, mode, &members)
            }
            "delete_bond" => {
                let name = arg_str(op, args, 0)?;
                self.delete_bond(name)?;
                Ok(Value::Null)
            }
            "get_bond" => {
                let name = arg_str(op, args, 0)?;
                Ok(self.bond(name).unwrap_or(Value::Null))
            }
            "create_vlan" => {
                let parent = arg_str(op, args, 0)?;
                let vlan_id = arg_i64(op, args, 1)?;
                self.create_vlan(parent, vlan_id)
            }
            "delete_vlan" => {
                let parent = arg_str(op, args, 0)?;
                let vlan_id = arg_i64(op, args, 1)?;
                self.delete_vlan(parent, vlan_id)?;
                Ok(Value::Null)
            }
            "get_vlan" => {
                let parent = arg_str(op, args, 0)?;
                let vlan_id = arg_i64(op, args, 1)?;
                Ok(self.vlan(parent, vlan_id).unwrap_or(Value::Null))
            }
            "read_fdb" => {
                let bridge = arg_str(op, args, 0)?;
                let state = self.state.lock();
                if !state.bridges.contains_key(bridge) {
                    return Err(Error::Kernel(format!("bridge '{bridge}' does not exist")));
                }
                let entries = state.fdb.get(bridge).map(Vec::as_slice).unwrap_or(&[]);
                Ok(Value::Array(entries.iter().map(to_value).collect()))
            }
            "get_interface_state" => {
                let interface = arg_str(op, args, 0)?;
                let state = self.state.lock();
                let iface = state.interfaces.get(interface).ok_or_else(|| {
                    Error::Kernel(format!("interface '{interface}' does not exist"))
                })?;
                Ok(to_value(iface))
            }
            "get_arp_table" => {
                let state = self.state.lock();
                Ok(Value::Array(
                    state
                        .arp_table
                        .iter()
                        .map(|(ip, mac, device)| json!({"ip": ip, "mac": mac, "device": device}))
                        .collect(),
                ))
            }
            "track_resource" => {
                let rtype = arg_str(op, args, 0)?;
                let name = arg_str(op, args, 1)?;
                Kernel::track_resource(self, rtype, name);
                Ok(Value::Null)
            }
            "untrack_resource" => {
                let rtype = arg_str(op, args, 0)?;
                let name = arg_str(op, args, 1)?;
                Kernel::untrack_resource(self, rtype, name);
                Ok(Value::Null)
            }
            _ => Err(Error::Kernel(format!("unknown operation '{op}'"))),
        }
    }

    fn create_bridge(&mut self, name: &str, interfaces: &[String]) -> Result<Value> {
        let mut state = self.state.lock();
        if name.is_empty() {
            return Err(Error::Kernel("bridge name cannot be empty".into()));
        }
        if state.bridges.contains_key(name) {
            return Err(Error::Kernel(format!("bridge '{name}' already exists")));
        }
        let bridge = BridgeState {
            name: name.to_string(),
            interfaces: interfaces.to_vec(),
            stp_enabled: false,
            forward_delay: 15,
        };
        let result = to_value(&bridge);
        state.bridges.insert(name.to_string(), bridge);
        state.fdb.insert(name.to_string(), Vec::new());
        ensure_interface(&mut state, name);
        for iface in interfaces {
            ensure_interface(&mut state, iface);
            state.interfaces.get_mut(iface).expect("just ensured").master = name.to_string();
        }
        Ok(result)
    }

    fn delete_bridge(&mut self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let bridge = state
            .bridges
            .remove(name)
            .ok_or_else(|| Error::Kernel(format!("bridge '{name}' does not exist")))?;
        for iface in &bridge.interfaces {
            if let Some(iface_state) = state.interfaces.get_mut(iface) {
                iface_state.master = String::new();
            }
        }
        state.fdb.remove(name);
        state.interfaces.remove(name);
        Ok(())
    }

    fn attach_interface(&mut self, bridge: &str, interface: &str) -> Result<()> {
        let mut state = self.state.lock();
        let br = state
            .bridges
            .get_mut(bridge)
            .ok_or_else(|| Error::Kernel(format!("bridge '{bridge}' does not exist")))?;
        if br.interfaces.iter().any(|i| i == interface) {
            return Err(Error::Kernel(format!(
                "interface '{interface}' already attached to '{bridge}'"
            )));
        }
        br.interfaces.push(interface.to_string());
        ensure_interface(&mut state, interface);
        state
            .interfaces
            .get_mut(interface)
            .expect("just ensured")
            .master = bridge.to_string();
        Ok(())
    }

    fn detach_interface(&mut self, bridge: &str, interface: &str) -> Result<()> {
        let mut state = self.state.lock();
        let br = state
            .bridges
            .get_mut(bridge)
            .ok_or_else(|| Error::Kernel(format!("bridge '{bridge}' does not exist")))?;
        if !br.interfaces.iter().any(|i| i == interface) {
            return Err(Error::Kernel(format!(
                "interface '{interface}' not attached to '{bridge}'"
            )));
        }
        br.interfaces.retain(|i| i != interface);
        if let Some(iface) = state.interfaces.get_mut(interface) {
            iface.master = String::new();
        }
        Ok(())
    }

    fn set_stp(&mut self, bridge: &str, enabled: bool, forward_delay: i64) -> Result<Value> {
        let mut state = self.state.lock();
        let br = state
            .bridges
            .get_mut(bridge)
            .ok_or_else(|| Error::Kernel(format!("bridge '{bridge}' does not exist")))?;
        if !(1..=30).contains(&forward_delay) {
            return Err(Error::Kernel(format!(
                "forward_delay must be 1-30, got {forward_delay}"
            )));
        }
        br.stp_enabled = enabled;
        br.forward_delay = forward_delay;
        Ok(to_value(br))
    }

    fn get_stp_state(&self, bridge: &str) -> Result<Value> {
        let state = self.state.lock();
        let br = state
            .bridges
            .get(bridge)
            .ok_or_else(|| Error::Kernel(format!("bridge '{bridge}' does not exist")))?;
        Ok(json!({
            "bridge": bridge,
            "enabled": br.stp_enabled,
            "forward_delay": br.forward_delay,
            "root_id": bridge,
            "bridge_id": bridge,
            "topology_change": false,
        }))
    }

    fn create_bond(&mut self, name: &str, mode: &str, members: &[String]) -> Result<Value> {
        let mut state = self.state.lock();
        if name.is_empty() {
            return Err(Error::Kernel("bond name cannot be empty".into()));
        }
        if state.bonds.contains_key(name) {
            return Err(Error::Kernel(format!("bond '{name}' already exists")));
        }
        let bond = BondState {
            name: name.to_string(),
            mode: mode.to_string(),
            members: members.to_vec(),
            active: true,
        };
        let result = to_value(&bond);
        state.bonds.insert(name.to_string(), bond);
        ensure_interface(&mut state, name);
        for member in members {
            ensure_interface(&mut state, member);
            state.interfaces.get_mut(member).expect("just ensured").master = name.to_string();
        }
        Ok(result)
    }

    fn delete_bond(&mut self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let bond = state
            .bonds
            .remove(name)
            .ok_or_else(|| Error::Kernel(format!("bond '{name}' does not exist")))?;
        for member in &bond.members {
            if let Some(iface) = state.interfaces.get_mut(member) {
                iface.master = String::new();
            }
        }
        state.interfaces.remove(name);
        Ok(())
    }

    fn create_vlan(&mut self, parent: &str, vlan_id: i64) -> Result<Value> {
        let mut state = self.state.lock();
        let key = format!("{parent}.{vlan_id}");
        if state.vlans.contains_key(&key) {
            return Err(Error::Kernel(format!(
                "VLAN {vlan_id} already exists on '{parent}'"
            )));
        }
        if !(1..=4094).contains(&vlan_id) {
            return Err(Error::Kernel(format!("VLAN ID must be 1-4094, got {vlan_id}")));
        }
        let vlan = VlanState {
            name: key.clone(),
            parent: parent.to_string(),
            vlan_id,
        };
        let result = to_value(&vlan);
        state.vlans.insert(key.clone(), vlan);
        ensure_interface(&mut state, &key);
        Ok(result)
    }

    fn delete_vlan(&mut self, parent: &str, vlan_id: i64) -> Result<()> {
        let mut state = self.state.lock();
        let key = format!("{parent}.{vlan_id}");
        state
            .vlans
            .remove(&key)
            .ok_or_else(|| Error::Kernel(format!("VLAN {vlan_id} does not exist on '{parent}'")))?;
        state.interfaces.remove(&key);
        Ok(())
    }
}

fn ensure_interface(state: &mut NetState, name: &str) {
    if !state.interfaces.contains_key(name) {
        state.interfaces.insert(
            name.to_string(),
            InterfaceState {
                name: name.to_string(),
                mac: generate_mac(name),
                carrier: true,
                operstate: "up".into(),
                master: String::new(),
            },
        );
    }
}

/// Deterministic locally-administered unicast MAC derived from the name.
fn generate_mac(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    let mut octets = [0u8; 6];
    octets.copy_from_slice(&digest[..6]);
    octets[0] = (octets[0] & 0xFE) | 0x02;
    octets
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).expect("in-memory state serializes")
}

impl Kernel for MockNetKernel {
    fn domain_name(&self) -> &str {
        "network"
    }

    fn reset(&mut self) {
        *self.state.lock() = NetState::default();
    }

    fn create_shadow(&self) -> Box<dyn Kernel> {
        Box::new(MockNetKernel::new())
    }

    fn describe_operations(&self) -> Vec<String> {
        vec![
            "create_bridge(name: string, interfaces: string[]) -> object".into(),
            "delete_bridge(name: string) -> null".into(),
            "attach_interface(bridge: string, interface: string) -> null".into(),
            "detach_interface(bridge: string, interface: string) -> null".into(),
            "get_bridge(name: string) -> object | null".into(),
            "set_stp(bridge: string, enabled: bool, forward_delay: int) -> object".into(),
            "get_stp_state(bridge: string) -> object".into(),
            "get_device_mac(device: string) -> string".into(),
            "set_device_mac(device: string, mac: string) -> null".into(),
            "send_gratuitous_arp(interface: string, mac: string) -> null".into(),
            "create_bond(name: string, mode: string, members: string[]) -> object".into(),
            "delete_bond(name: string) -> null".into(),
            "get_bond(name: string) -> object | null".into(),
            "create_vlan(parent: string, vlan_id: int) -> object".into(),
            "delete_vlan(parent: string, vlan_id: int) -> null".into(),
            "get_vlan(parent: string, vlan_id: int) -> object | null".into(),
            "read_fdb(bridge: string) -> object[]".into(),
            "get_interface_state(interface: string) -> object".into(),
            "get_arp_table() -> object[]".into(),
            "track_resource(type: string, name: string) -> null".into(),
            "untrack_resource(type: string, name: string) -> null".into(),
        ]
    }

    fn mutation_prompt_context(&self) -> String {
        "This gene operates on Linux network configuration. The sdk handle \
         provides bridge, bond, VLAN, STP, MAC, and diagnostic operations. \
         Bridges group interfaces. VLANs segment traffic. STP prevents \
         loops. Bonds aggregate links."
            .to_string()
    }

    fn op_spec(&self, op: &str) -> Option<OpSpec> {
        OPS.iter().find(|spec| spec.name == op).cloned()
    }

    fn invoke(&mut self, op: &str, args: &[Value]) -> Result<Value> {
        self.check_failure(op)?;
        if matches!(self.op_spec(op).map(|s| s.kind), Some(OpKind::Mutating { .. })) {
            self.check_mutation_budget()?;
        }
        self.dispatch(op, args)
    }

    fn snapshot(&mut self, op: &str, args: &[Value]) -> Result<Value> {
        match op {
            "delete_bridge" => Ok(self.bridge(arg_str(op, args, 0)?).unwrap_or(Value::Null)),
            "set_stp" => self.get_stp_state(arg_str(op, args, 0)?),
            "set_device_mac" => {
                let device = arg_str(op, args, 0)?;
                let state = self.state.lock();
                let iface = state
                    .interfaces
                    .get(device)
                    .ok_or_else(|| Error::Kernel(format!("device '{device}' does not exist")))?;
                Ok(Value::String(iface.mac.clone()))
            }
            "delete_bond" => Ok(self.bond(arg_str(op, args, 0)?).unwrap_or(Value::Null)),
            "delete_vlan" => {
                let parent = arg_str(op, args, 0)?;
                let vlan_id = arg_i64(op, args, 1)?;
                Ok(self.vlan(parent, vlan_id).unwrap_or(Value::Null))
            }
            _ => Err(Error::Kernel(format!("operation '{op}' takes no snapshot"))),
        }
    }

    fn undo(&mut self, op: &str, snapshot: &Value, args: &[Value]) -> Result<()> {
        match op {
            "create_bridge" => self.delete_bridge(arg_str(op, args, 0)?),
            "delete_bridge" => {
                if let Some(obj) = snapshot.as_object() {
                    let name = obj.get("name").and_then(Value::as_str).unwrap_or_default();
                    let interfaces: Vec<String> = obj
                        .get("interfaces")
                        .and_then(Value::as_array)
                        .map(|a| {
                            a.iter()
                                .filter_map(Value::as_str)
                                .map(ToString::to_string)
                                .collect()
                        })
                        .unwrap_or_default();
                    self.create_bridge(name, &interfaces)?;
                }
                Ok(())
            }
            "attach_interface" => {
                self.detach_interface(arg_str(op, args, 0)?, arg_str(op, args, 1)?)
            }
            "detach_interface" => {
                self.attach_interface(arg_str(op, args, 0)?, arg_str(op, args, 1)?)
            }
            "set_stp" => {
                let bridge = arg_str(op, args, 0)?;
                let enabled = snapshot
                    .get("enabled")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let delay = snapshot
                    .get("forward_delay")
                    .and_then(Value::as_i64)
                    .unwrap_or(15);
                self.set_stp(bridge, enabled, delay)?;
                Ok(())
            }
            "set_device_mac" => {
                let device = arg_str(op, args, 0)?;
                let mac = snapshot
                    .as_str()
                    .ok_or_else(|| Error::Kernel("missing mac snapshot".into()))?;
                let mut state = self.state.lock();
                let iface = state
                    .interfaces
                    .get_mut(device)
                    .ok_or_else(|| Error::Kernel(format!("device '{device}' does not exist")))?;
                iface.mac = mac.to_string();
                Ok(())
            }
            "create_bond" => self.delete_bond(arg_str(op, args, 0)?),
            "delete_bond" => {
                if let Some(obj) = snapshot.as_object() {
                    let name = obj.get("name").and_then(Value::as_str).unwrap_or_default();
                    let mode = obj.get("mode").and_then(Value::as_str).unwrap_or_default();
                    let members: Vec<String> = obj
                        .get("members")
                        .and_then(Value::as_array)
                        .map(|a| {
                            a.iter()
                                .filter_map(Value::as_str)
                                .map(ToString::to_string)
                                .collect()
                        })
                        .unwrap_or_default();
                    self.create_bond(name, mode, &members)?;
                }
                Ok(())
            }
            "create_vlan" => self.delete_vlan(arg_str(op, args, 0)?, arg_i64(op, args, 1)?),
            "delete_vlan" => {
                if snapshot.is_object() {
                    self.create_vlan(arg_str(op, args, 0)?, arg_i64(op, args, 1)?)?;
                }
                Ok(())
            }
            _ => Err(Error::Kernel(format!("operation '{op}' has no undo"))),
        }
    }

    fn track_resource(&mut self, resource_type: &str, name: &str) {
        let mut state = self.state.lock();
        let pair = (resource_type.to_string(), name.to_string());
        if !state.tracked.contains(&pair) {
            state.tracked.push(pair);
        }
    }

    fn untrack_resource(&mut self, resource_type: &str, name: &str) {
        let mut state = self.state.lock();
        let pair = (resource_type.to_string(), name.to_string());
        state.tracked.retain(|p| p != &pair);
    }

    fn tracked_resources(&self) -> Vec<(String, String)> {
        self.state.lock().tracked.clone()
    }

    fn delete_resource(&mut self, resource_type: &str, name: &str) -> Result<()> {
        match resource_type {
            "bridge" => self.delete_bridge(name)?,
            "bond" => self.delete_bond(name)?,
            "vlan" => {
                if let Some((parent, id)) = name.split_once('.') {
                    let vlan_id = id
                        .parse::<i64>()
                        .map_err(|_| Error::Kernel(format!("bad vlan name '{name}'")))?;
                    self.delete_vlan(parent, vlan_id)?;
                }
            }
            _ => {}
        }
        Kernel::untrack_resource(self, resource_type, name);
        Ok(())
    }

    fn resource_mappers(&self) -> std::collections::HashMap<String, ResourceMapper> {
        let mut mappers: std::collections::HashMap<String, ResourceMapper> =
            std::collections::HashMap::new();
        mappers.insert("bridge".into(), map_bridge);
        mappers.insert("bond".into(), map_bond);
        mappers.insert("vlan_bridges".into(), map_vlan_bridges);
        mappers
    }
}

// --- Network topology resource mappers ---

fn data_or(data: &Map<String, Value>, key: &str, fallback: Value) -> Value {
    data.get(key).cloned().unwrap_or(fallback)
}

fn bridge_interfaces(data: &Map<String, Value>) -> Value {
    data.get("bridge_ifaces")
        .or_else(|| data.get("interfaces"))
        .cloned()
        .unwrap_or_else(|| Value::Array(vec![]))
}

/// Bridge resources map to the management-bridge pathway when an uplink
/// is declared, the STP pathway when `stp` is set, and the bare gene
/// otherwise.
fn map_bridge(resource: &TopologyResource, data: &Map<String, Value>) -> Result<TopologyStep> {
    let props = &resource.properties;
    let bridge_name = data_or(data, "bridge_name", Value::String(resource.name.clone()));

    if let Some(uplink) = props.get("uplink") {
        let input = json!({
            "bridge_name": bridge_name,
            "interfaces": bridge_interfaces(data),
            "uplink": resolve_value(uplink, data),
            "stp_enabled": true,
            "forward_delay": data_or(data, "forward_delay", json!(15)),
        });
        return Ok(TopologyStep {
            resource_name: resource.name.clone(),
            action: TopologyAction::Pathway,
            target: "provision_management_bridge".into(),
            input_json: input.to_string(),
            loop_items: vec![],
        });
    }

    if props.contains_key("stp") {
        let input = json!({
            "bridge_name": bridge_name,
            "interfaces": bridge_interfaces(data),
            "stp_enabled": true,
            "forward_delay": data_or(data, "forward_delay", json!(15)),
        });
        return Ok(TopologyStep {
            resource_name: resource.name.clone(),
            action: TopologyAction::Pathway,
            target: "configure_bridge_with_stp".into(),
            input_json: input.to_string(),
            loop_items: vec![],
        });
    }

    let input = json!({
        "bridge_name": bridge_name,
        "interfaces": bridge_interfaces(data),
    });
    Ok(TopologyStep {
        resource_name: resource.name.clone(),
        action: TopologyAction::Gene,
        target: "bridge_create".into(),
        input_json: input.to_string(),
        loop_items: vec![],
    })
}

fn map_bond(resource: &TopologyResource, data: &Map<String, Value>) -> Result<TopologyStep> {
    let props = &resource.properties;
    let input = json!({
        "bond_name": data_or(data, "bond_name", Value::String(resource.name.clone())),
        "mode": resolve_value(props.get("mode").map_or("active-backup", String::as_str), data),
        "members": resolve_value(props.get("members").map_or("[]", String::as_str), data),
    });
    Ok(TopologyStep {
        resource_name: resource.name.clone(),
        action: TopologyAction::Gene,
        target: "bond_create".into(),
        input_json: input.to_string(),
        loop_items: vec![],
    })
}

/// VLAN sets loop one `vlan_create` call per declared id, with the trunk
/// resolved to the bond carrying them.
fn map_vlan_bridges(resource: &TopologyResource, data: &Map<String, Value>) -> Result<TopologyStep> {
    let props = &resource.properties;
    let mut vlans = resolve_value(props.get("vlans").map_or("[]", String::as_str), data);
    if let Value::String(text) = &vlans {
        vlans = serde_json::from_str(text).unwrap_or_else(|_| Value::Array(vec![]));
    }

    let trunk_ref = props.get("trunk").cloned().unwrap_or_default();
    let parent = data_or(data, "bond_name", Value::String(trunk_ref));

    let loop_items = vlans
        .as_array()
        .map(|ids| {
            ids.iter()
                .map(|vlan_id| json!({"parent": parent, "vlan_id": vlan_id}).to_string())
                .collect()
        })
        .unwrap_or_default();

    Ok(TopologyStep {
        resource_name: resource.name.clone(),
        action: TopologyAction::LoopGene,
        target: "vlan_create".into(),
        input_json: "{}".into(),
        loop_items,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[Value]) -> Vec<Value> {
        values.to_vec()
    }

    #[test]
    fn create_and_get_bridge() {
        let mut kernel = MockNetKernel::new();
        let out = kernel
            .invoke("create_bridge", &args(&[json!("br0"), json!(["eth0", "eth1"])]))
            .unwrap();
        assert_eq!(out["stp_enabled"], json!(false));
        assert_eq!(out["forward_delay"], json!(15));

        let bridge = kernel.invoke("get_bridge", &args(&[json!("br0")])).unwrap();
        assert_eq!(bridge["interfaces"], json!(["eth0", "eth1"]));
        // Member interfaces gained the bridge as master.
        let eth0 = kernel
            .invoke("get_interface_state", &args(&[json!("eth0")]))
            .unwrap();
        assert_eq!(eth0["master"], json!("br0"));
    }

    #[test]
    fn duplicate_bridge_rejected() {
        let mut kernel = MockNetKernel::new();
        kernel
            .invoke("create_bridge", &args(&[json!("br0"), json!([])]))
            .unwrap();
        let err = kernel
            .invoke("create_bridge", &args(&[json!("br0"), json!([])]))
            .unwrap_err();
        assert!(matches!(err, Error::Kernel(_)));
    }

    #[test]
    fn stp_bounds_enforced() {
        let mut kernel = MockNetKernel::new();
        kernel
            .invoke("create_bridge", &args(&[json!("br0"), json!([])]))
            .unwrap();
        assert!(kernel
            .invoke("set_stp", &args(&[json!("br0"), json!(true), json!(31)]))
            .is_err());
        let out = kernel
            .invoke("set_stp", &args(&[json!("br0"), json!(true), json!(20)]))
            .unwrap();
        assert_eq!(out["forward_delay"], json!(20));
    }

    #[test]
    fn injected_failure_fires_once() {
        let mut kernel = MockNetKernel::new();
        kernel.inject_failure("create_bridge", "simulated failure");
        assert!(kernel
            .invoke("create_bridge", &args(&[json!("br0"), json!([])]))
            .is_err());
        assert!(kernel
            .invoke("create_bridge", &args(&[json!("br0"), json!([])]))
            .is_ok());
    }

    #[test]
    fn mutation_budget_failure() {
        let mut kernel = MockNetKernel::new();
        kernel.fail_at_mutation(2);
        kernel
            .invoke("create_bridge", &args(&[json!("br0"), json!([])]))
            .unwrap();
        let err = kernel
            .invoke("create_bridge", &args(&[json!("br1"), json!([])]))
            .unwrap_err();
        assert!(err.to_string().contains("simulated failure"));
    }

    #[test]
    fn link_failure_observed_by_diagnostics() {
        let mut kernel = MockNetKernel::new();
        kernel
            .invoke("create_bridge", &args(&[json!("br0"), json!(["eth0"])]))
            .unwrap();
        kernel.inject_link_failure("eth0");
        let state = kernel
            .invoke("get_interface_state", &args(&[json!("eth0")]))
            .unwrap();
        assert_eq!(state["carrier"], json!(false));
        assert_eq!(state["operstate"], json!("down"));
    }

    #[test]
    fn mac_flapping_shows_in_fdb() {
        let mut kernel = MockNetKernel::new();
        kernel
            .invoke("create_bridge", &args(&[json!("br0"), json!(["eth0", "eth1"])]))
            .unwrap();
        kernel
            .inject_mac_flapping("br0", "de:ad:be:ef:00:01", &["eth0", "eth1"])
            .unwrap();
        let fdb = kernel.invoke("read_fdb", &args(&[json!("br0")])).unwrap();
        assert_eq!(fdb.as_array().unwrap().len(), 2);
    }

    #[test]
    fn shadow_kernel_starts_fresh() {
        let mut kernel = MockNetKernel::new();
        kernel
            .invoke("create_bridge", &args(&[json!("br0"), json!([])]))
            .unwrap();
        let mut shadow = kernel.create_shadow();
        let missing = shadow.invoke("get_bridge", &args(&[json!("br0")])).unwrap();
        assert_eq!(missing, Value::Null);
    }

    #[test]
    fn clone_handles_share_state() {
        let kernel = MockNetKernel::new();
        let mut handle: Box<dyn Kernel> = Box::new(kernel.clone());
        handle
            .invoke("create_bridge", &args(&[json!("br0"), json!([])]))
            .unwrap();
        assert!(kernel.bridge("br0").is_some());
    }

    #[test]
    fn undo_reverses_create_and_set() {
        let mut kernel = MockNetKernel::new();
        kernel
            .invoke("create_bridge", &args(&[json!("br0"), json!(["eth0"])]))
            .unwrap();
        let snap = kernel
            .snapshot("set_stp", &args(&[json!("br0"), json!(true), json!(20)]))
            .unwrap();
        kernel
            .invoke("set_stp", &args(&[json!("br0"), json!(true), json!(20)]))
            .unwrap();
        kernel
            .undo("set_stp", &snap, &args(&[json!("br0"), json!(true), json!(20)]))
            .unwrap();
        let bridge = kernel.bridge("br0").unwrap();
        assert_eq!(bridge["stp_enabled"], json!(false));
        assert_eq!(bridge["forward_delay"], json!(15));

        kernel
            .undo("create_bridge", &Value::Null, &args(&[json!("br0"), json!(["eth0"])]))
            .unwrap();
        assert!(kernel.bridge("br0").is_none());
    }

    #[test]
    fn self_description_covers_every_operation() {
        let kernel = MockNetKernel::new();
        assert_eq!(kernel.domain_name(), "network");
        let described = kernel.describe_operations();
        for spec in OPS {
            assert!(
                described.iter().any(|line| line.starts_with(spec.name)),
                "operation {} missing from description",
                spec.name
            );
        }
        assert!(!kernel.mutation_prompt_context().is_empty());
    }

    #[test]
    fn delete_resource_clears_tracking() {
        let mut kernel = MockNetKernel::new();
        kernel
            .invoke("create_bridge", &args(&[json!("br0"), json!([])]))
            .unwrap();
        Kernel::track_resource(&mut kernel, "bridge", "br0");
        kernel.delete_resource("bridge", "br0").unwrap();
        assert!(kernel.tracked_resources().is_empty());
        assert!(kernel.bridge("br0").is_none());
    }
}
