use ulid::Ulid;

use crate::auth::Principal;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// All pools in weekday order, or the one for `day`. An unknown day
    /// name matches nothing.
    pub async fn list_pools(&self, day: Option<&str>) -> Vec<PoolInfo> {
        let pools = match day {
            None => self.registry.all(),
            Some(name) => Weekday::from_name(name)
                .and_then(|d| self.registry.id_for_day(d))
                .and_then(|id| self.registry.get(&id))
                .into_iter()
                .collect(),
        };
        let mut out = Vec::with_capacity(pools.len());
        for shared in pools {
            out.push(shared.read().await.info());
        }
        out
    }

    pub async fn get_pool(&self, id: Ulid) -> Result<PoolInfo, EngineError> {
        let shared = self.registry.get(&id).ok_or(EngineError::PoolNotFound(id))?;
        let info = shared.read().await.info();
        Ok(info)
    }

    /// With a requester, a record owned by someone else reads as missing.
    pub fn get_reservation(&self, id: Ulid, requester_id: Option<Ulid>) -> Result<Reservation, EngineError> {
        self.ledger
            .find(&id)
            .filter(|r| requester_id.is_none_or(|req| r.requester_id == req))
            .ok_or(EngineError::NotFound(id))
    }

    /// Everything for an admin, otherwise the caller's own records.
    pub fn list_reservations(&self, principal: &Principal) -> Vec<Reservation> {
        if principal.is_admin() {
            self.ledger.find_all()
        } else {
            self.ledger.find_by_requester(&principal.requester_id)
        }
    }

    /// Every reservation with claimant and requester blanked to the nil id,
    /// so anyone can see which slots are taken on which dates.
    pub fn list_reservations_anonymized(&self) -> Vec<Reservation> {
        self.ledger
            .find_all()
            .into_iter()
            .map(|r| Reservation {
                claimant_id: Ulid::nil(),
                requester_id: Ulid::nil(),
                ..r
            })
            .collect()
    }

    /// A claimant's reservations, limited to the caller's own unless admin.
    pub fn reservations_for_claimant(&self, claimant_id: Ulid, principal: &Principal) -> Vec<Reservation> {
        self.ledger
            .find_by_claimant(&claimant_id)
            .into_iter()
            .filter(|r| principal.may_act_on(r))
            .collect()
    }
}
