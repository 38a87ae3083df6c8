use crate::discovery::{PacketInfo, Requester, ResponseAction, ALL_NODES};
use std::collections::HashSet;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::time::Duration;

pub const NODEINFO_QUERY: &str = "nodeinfo";

pub fn default_mesh_protocols() -> Vec<String> {
  vec!["gluon_mesh".to_string(), "gluon_wired".to_string()]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshInterface {
  pub name: String,
  pub index: u32,
  pub up: bool,
  pub protocol: String,
}

impl MeshInterface {
  pub fn is_mesh(&self, mesh_protocols: &[String]) -> bool {
    mesh_protocols.iter().any(|p| *p == self.protocol)
  }
}

/// A peer that answered the nodeinfo query during one discovery round.
#[derive(Debug, Clone)]
pub struct Neighbour<P> {
  pub node_id: String,
  pub address: Ipv6Addr,
  /// Interface the query was sent on.
  pub interface: MeshInterface,
  pub payload: Option<P>,
}

/// Runs one nodeinfo round on every mesh interface that is up.
///
/// `extract` decides whether a freshly discovered neighbour is kept and may
/// fill in its payload; `Ok(false)` and `Err` both drop it. Neighbours are
/// returned in arrival order. A node id is only accepted once, even when it
/// answers on several interfaces. The round fails only if every queried
/// interface failed.
pub fn collect<P, R: Requester + ?Sized>(
  requester: &R,
  interfaces: &[MeshInterface],
  mesh_protocols: &[String],
  port: u16,
  budget: Duration,
  mut extract: impl FnMut(&serde_json::Value, &mut Neighbour<P>) -> anyhow::Result<bool>,
) -> anyhow::Result<Vec<Neighbour<P>>> {
  let mut found: Vec<Neighbour<P>> = Vec::new();
  let mut seen: HashSet<String> = HashSet::new();
  let mut queried = 0usize;
  let mut failed = 0usize;
  let mut last_err: Option<anyhow::Error> = None;

  for iface in interfaces {
    if !iface.up || !iface.is_mesh(mesh_protocols) {
      continue;
    }
    queried += 1;

    let dst = SocketAddrV6::new(ALL_NODES, port, 0, iface.index);
    let mut handler = |data: &[u8], info: &PacketInfo| -> anyhow::Result<ResponseAction> {
      if let Some(neighbour) = accept_response(data, info, iface, &mut seen, &mut extract) {
        found.push(neighbour);
      }
      Ok(ResponseAction::Continue)
    };

    if let Err(e) = requester.request(&dst, NODEINFO_QUERY, budget, Some(&mut handler)) {
      tracing::warn!(interface = %iface.name, error = %e, "neighbour discovery failed on interface");
      failed += 1;
      last_err = Some(anyhow::Error::new(e).context(format!("discover neighbours on {}", iface.name)));
    }
  }

  if failed == queried {
    if let Some(e) = last_err {
      return Err(e);
    }
  }

  tracing::debug!(interfaces = queried, neighbours = found.len(), "discovery round finished");
  Ok(found)
}

fn accept_response<P>(
  data: &[u8],
  info: &PacketInfo,
  iface: &MeshInterface,
  seen: &mut HashSet<String>,
  extract: &mut impl FnMut(&serde_json::Value, &mut Neighbour<P>) -> anyhow::Result<bool>,
) -> Option<Neighbour<P>> {
  if info.ifindex == 0 {
    return None;
  }

  let json: serde_json::Value = serde_json::from_slice(data).ok()?;
  let node_id = json.get("node_id")?.as_str()?;
  if seen.contains(node_id) {
    return None;
  }

  let mut neighbour = Neighbour {
    node_id: node_id.to_string(),
    address: info.source,
    interface: iface.clone(),
    payload: None,
  };

  match extract(&json, &mut neighbour) {
    Ok(true) => {}
    Ok(false) => return None,
    Err(e) => {
      tracing::debug!(node_id = %neighbour.node_id, error = %e, "neighbour rejected");
      return None;
    }
  }

  seen.insert(neighbour.node_id.clone());
  Some(neighbour)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::discovery::{DiscoveryError, ResponseHandler, Termination};
  use std::cell::RefCell;
  use std::collections::HashMap;
  use std::io;

  #[derive(Default)]
  struct FakeRequester {
    /// Responses per scope id, as (payload, source, ifindex).
    responses: HashMap<u32, Vec<(String, Ipv6Addr, u32)>>,
    failing: HashSet<u32>,
    calls: RefCell<Vec<(SocketAddrV6, String, Duration)>>,
  }

  impl FakeRequester {
    fn respond(mut self, scope: u32, payload: &str, source: Ipv6Addr) -> Self {
      self.responses.entry(scope).or_default().push((payload.to_string(), source, scope));
      self
    }
  }

  impl Requester for FakeRequester {
    fn request(
      &self,
      dst: &SocketAddrV6,
      query: &str,
      budget: Duration,
      on_response: Option<&mut ResponseHandler<'_>>,
    ) -> Result<Termination, DiscoveryError> {
      self.calls.borrow_mut().push((*dst, query.to_string(), budget));
      if self.failing.contains(&dst.scope_id()) {
        return Err(DiscoveryError::Transport(io::Error::new(io::ErrorKind::Other, "no route")));
      }
      let Some(cb) = on_response else {
        return Ok(Termination::Done);
      };
      for (payload, source, ifindex) in self.responses.get(&dst.scope_id()).cloned().unwrap_or_default() {
        let info = PacketInfo { source, ifindex };
        match cb(payload.as_bytes(), &info).map_err(DiscoveryError::Handler)? {
          ResponseAction::Continue => {}
          ResponseAction::Cancel => return Ok(Termination::Cancelled),
        }
      }
      Ok(Termination::Done)
    }
  }

  fn iface(name: &str, index: u32, up: bool, protocol: &str) -> MeshInterface {
    MeshInterface {
      name: name.to_string(),
      index,
      up,
      protocol: protocol.to_string(),
    }
  }

  fn addr(last: u16) -> Ipv6Addr {
    Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, last)
  }

  fn keep_all(_: &serde_json::Value, _: &mut Neighbour<()>) -> anyhow::Result<bool> {
    Ok(true)
  }

  #[test]
  fn queries_only_mesh_interfaces_that_are_up() {
    let req = FakeRequester::default();
    let ifaces = vec![
      iface("mesh0", 3, true, "gluon_mesh"),
      iface("wan", 4, true, "dhcp"),
      iface("mesh1", 5, false, "gluon_wired"),
      iface("mesh2", 6, true, "gluon_wired"),
    ];
    let out = collect(&req, &ifaces, &default_mesh_protocols(), 1001, Duration::from_secs(3), keep_all).unwrap();
    assert!(out.is_empty());

    let calls = req.calls.borrow();
    let scopes: Vec<u32> = calls.iter().map(|(dst, _, _)| dst.scope_id()).collect();
    assert_eq!(scopes, vec![3, 6]);
    for (dst, query, budget) in calls.iter() {
      assert_eq!(*dst.ip(), ALL_NODES);
      assert_eq!(dst.port(), 1001);
      assert_eq!(query, "nodeinfo");
      assert_eq!(*budget, Duration::from_secs(3));
    }
  }

  #[test]
  fn same_node_on_two_interfaces_is_listed_once() {
    let req = FakeRequester::default()
      .respond(3, r#"{"node_id":"aabbcc"}"#, addr(1))
      .respond(6, r#"{"node_id":"aabbcc"}"#, addr(2))
      .respond(6, r#"{"node_id":"ddeeff"}"#, addr(3));
    let ifaces = vec![iface("mesh0", 3, true, "gluon_mesh"), iface("mesh1", 6, true, "gluon_wired")];

    let out = collect(&req, &ifaces, &default_mesh_protocols(), 1001, Duration::from_secs(3), keep_all).unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].node_id, "aabbcc");
    assert_eq!(out[0].address, addr(1));
    assert_eq!(out[0].interface.name, "mesh0");
    assert_eq!(out[1].node_id, "ddeeff");
    assert_eq!(out[1].interface.name, "mesh1");
  }

  #[test]
  fn drops_malformed_and_infoless_responses() {
    let mut req = FakeRequester::default()
      .respond(3, "not json", addr(1))
      .respond(3, r#"{"hostname":"x"}"#, addr(2))
      .respond(3, r#"{"node_id":42}"#, addr(3))
      .respond(3, r#"{"node_id":"good"}"#, addr(4));
    req
      .responses
      .get_mut(&3)
      .unwrap()
      .push((r#"{"node_id":"noinfo"}"#.to_string(), addr(5), 0));

    let ifaces = vec![iface("mesh0", 3, true, "gluon_mesh")];
    let out = collect(&req, &ifaces, &default_mesh_protocols(), 1001, Duration::from_secs(3), keep_all).unwrap();
    let ids: Vec<&str> = out.iter().map(|n| n.node_id.as_str()).collect();
    assert_eq!(ids, vec!["good"]);
  }

  #[test]
  fn extract_fills_payload_and_can_veto() {
    let req = FakeRequester::default()
      .respond(3, r#"{"node_id":"a","software":{"firmware":{"release":"v2"}}}"#, addr(1))
      .respond(3, r#"{"node_id":"b"}"#, addr(2))
      .respond(3, r#"{"node_id":"c","software":{"firmware":{"release":"v3"}}}"#, addr(3));
    let ifaces = vec![iface("mesh0", 3, true, "gluon_mesh")];

    let extract = |json: &serde_json::Value, n: &mut Neighbour<String>| -> anyhow::Result<bool> {
      let release = json
        .pointer("/software/firmware/release")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("no release"))?;
      if release == "v3" {
        return Ok(false);
      }
      n.payload = Some(release.to_string());
      Ok(true)
    };

    let out = collect(&req, &ifaces, &default_mesh_protocols(), 1001, Duration::from_secs(3), extract).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].node_id, "a");
    assert_eq!(out[0].payload.as_deref(), Some("v2"));
  }

  #[test]
  fn vetoed_node_may_be_accepted_from_a_later_response() {
    let req = FakeRequester::default()
      .respond(3, r#"{"node_id":"a","ok":false}"#, addr(1))
      .respond(3, r#"{"node_id":"a","ok":true}"#, addr(2));
    let ifaces = vec![iface("mesh0", 3, true, "gluon_mesh")];
    let extract = |json: &serde_json::Value, _: &mut Neighbour<()>| -> anyhow::Result<bool> {
      Ok(json["ok"].as_bool().unwrap_or(false))
    };
    let out = collect(&req, &ifaces, &default_mesh_protocols(), 1001, Duration::from_secs(3), extract).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].address, addr(2));
  }

  #[test]
  fn one_failing_interface_does_not_fail_the_round() {
    let mut req = FakeRequester::default().respond(6, r#"{"node_id":"a"}"#, addr(1));
    req.failing.insert(3);
    let ifaces = vec![iface("mesh0", 3, true, "gluon_mesh"), iface("mesh1", 6, true, "gluon_mesh")];
    let out = collect(&req, &ifaces, &default_mesh_protocols(), 1001, Duration::from_secs(3), keep_all).unwrap();
    assert_eq!(out.len(), 1);
  }

  #[test]
  fn failing_on_every_interface_reports_error() {
    let mut req = FakeRequester::default();
    req.failing.insert(3);
    req.failing.insert(6);
    let ifaces = vec![iface("mesh0", 3, true, "gluon_mesh"), iface("mesh1", 6, true, "gluon_mesh")];
    let err = collect(&req, &ifaces, &default_mesh_protocols(), 1001, Duration::from_secs(3), keep_all).unwrap_err();
    assert!(format!("{err:#}").contains("mesh1"));
  }
}
