//! Link fault injection.
//!
//! A state change is only committed to the [`Topology`] after the
//! substrate has applied it, so the recorded state never runs ahead of the
//! emulated network.

use tracing::{debug, info};

use crate::error::{HarnessError, Result};
use crate::substrate::Substrate;
use crate::topology::{HostId, LinkState, Topology};

/// What a [`set_link_state`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed { from: LinkState, to: LinkState },
    /// The link already held the requested state; the substrate was not touched.
    Unchanged(LinkState),
}

/// Set the link between `a` and `b` (either order) to `state`.
pub fn set_link_state(
    topology: &mut Topology,
    substrate: &mut dyn Substrate,
    a: &HostId,
    b: &HostId,
    state: LinkState,
) -> Result<Transition> {
    if !topology.is_instantiated() {
        return Err(HarnessError::NotInstantiated(topology.name().to_string()));
    }

    let link = topology
        .link_mut(a, b)
        .ok_or_else(|| HarnessError::LinkNotFound(a.clone(), b.clone()))?;

    if link.state == state {
        debug!(a = %a, b = %b, %state, "link already in requested state");
        return Ok(Transition::Unchanged(state));
    }

    substrate.set_link_state(&link.a, &link.b, state)?;

    let from = link.state;
    link.state = state;
    info!(a = %link.a, b = %link.b, %from, to = %state, "link state changed");
    Ok(Transition::Changed { from, to: state })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::sim::{SimOp, SimSubstrate};
    use crate::topology::LinkParams;

    fn setup() -> (Topology, SimSubstrate) {
        let mut topo = Topology::new("pair");
        topo.add_host("A").unwrap();
        topo.add_host("B").unwrap();
        topo.add_host("C").unwrap();
        topo.add_link("A", "B", LinkParams::default()).unwrap();
        topo.add_link("B", "C", LinkParams::default()).unwrap();
        let mut sim = SimSubstrate::new();
        topo.instantiate(&mut sim).unwrap();
        (topo, sim)
    }

    fn link_state_calls(sim: &SimSubstrate) -> usize {
        sim.calls()
            .iter()
            .filter(|c| matches!(c.op, SimOp::SetLinkState(..)))
            .count()
    }

    #[test]
    fn setting_the_same_state_twice_touches_substrate_once() {
        let (mut topo, mut sim) = setup();
        let (a, b) = (HostId::from("A"), HostId::from("B"));

        let first = set_link_state(&mut topo, &mut sim, &a, &b, LinkState::Down).unwrap();
        let second = set_link_state(&mut topo, &mut sim, &b, &a, LinkState::Down).unwrap();

        assert_eq!(
            first,
            Transition::Changed {
                from: LinkState::Up,
                to: LinkState::Down
            }
        );
        assert_eq!(second, Transition::Unchanged(LinkState::Down));
        assert_eq!(link_state_calls(&sim), 1);
        assert_eq!(topo.link(&a, &b).unwrap().state, LinkState::Down);
        assert_eq!(sim.link_state(&a, &b), Some(LinkState::Down));
    }

    #[test]
    fn missing_link_leaves_states_untouched() {
        let (mut topo, mut sim) = setup();
        let err = set_link_state(
            &mut topo,
            &mut sim,
            &"A".into(),
            &"C".into(),
            LinkState::Down,
        )
        .unwrap_err();

        assert!(matches!(err, HarnessError::LinkNotFound(..)));
        assert!(topo.links().iter().all(|l| l.state == LinkState::Up));
        assert_eq!(link_state_calls(&sim), 0);
    }

    #[test]
    fn substrate_failure_does_not_commit() {
        let (mut topo, mut sim) = setup();
        sim.fail_link_state("B", "C");

        let err = set_link_state(
            &mut topo,
            &mut sim,
            &"C".into(),
            &"B".into(),
            LinkState::Down,
        )
        .unwrap_err();

        assert!(matches!(err, HarnessError::Substrate(_)));
        assert_eq!(
            topo.link(&"B".into(), &"C".into()).unwrap().state,
            LinkState::Up
        );
    }

    #[test]
    fn requires_instantiated_topology() {
        let mut topo = Topology::new("cold");
        topo.add_host("A").unwrap();
        topo.add_host("B").unwrap();
        topo.add_link("A", "B", LinkParams::default()).unwrap();

        let mut sim = SimSubstrate::new();
        let err = set_link_state(
            &mut topo,
            &mut sim,
            &"A".into(),
            &"B".into(),
            LinkState::Down,
        )
        .unwrap_err();
        assert!(matches!(err, HarnessError::NotInstantiated(_)));
    }
}
