// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// Bots Instance (spec.md §4.8): RWAPI session create/update. Assigns
// leases, accepts lease state changes from the worker, and translates them
// into Job transitions via the Scheduler.

use std::sync::Arc;

use buildgrid_proto::re::Digest as ProtoDigest;
use buildgrid_proto::rwapi::bots_server::Bots;
use buildgrid_proto::rwapi::{
    BotSession, BotStatus, CreateBotSessionRequest, Lease, LeaseState as ProtoLeaseState,
    UpdateBotSessionRequest,
};
use buildgrid_scheduler::job::LeaseState;
use buildgrid_scheduler::Scheduler;
use prost::Message;
use tonic::{Request, Response, Status};

pub struct BotsInstanceService {
    scheduler: Arc<Scheduler>,
}

impl BotsInstanceService {
    pub fn new(scheduler: Arc<Scheduler>) -> BotsInstanceService {
        BotsInstanceService { scheduler }
    }
}

fn proto_to_lease_state(state: i32) -> LeaseState {
    match ProtoLeaseState::try_from(state).unwrap_or(ProtoLeaseState::LeaseStateUnspecified) {
        ProtoLeaseState::LeaseStateUnspecified => LeaseState::Unspecified,
        ProtoLeaseState::Pending => LeaseState::Pending,
        ProtoLeaseState::Active => LeaseState::Active,
        ProtoLeaseState::Completed => LeaseState::Completed,
        ProtoLeaseState::Cancelled => LeaseState::Cancelled,
    }
}

fn lease_state_to_proto(state: LeaseState) -> ProtoLeaseState {
    match state {
        LeaseState::Unspecified => ProtoLeaseState::LeaseStateUnspecified,
        LeaseState::Pending => ProtoLeaseState::Pending,
        LeaseState::Active => ProtoLeaseState::Active,
        LeaseState::Completed => ProtoLeaseState::Completed,
        LeaseState::Cancelled => ProtoLeaseState::Cancelled,
    }
}

/// Worker property set declared across all of a bot's devices, flattened
/// into the `name=value` pairs the Scheduler matches against (spec.md
/// §4.6). RWAPI has no single "capacity" field; this design treats the
/// number of declared devices as the bot's lease capacity, one task per
/// device (see DESIGN.md).
fn worker_properties_and_capacity(worker: &Option<buildgrid_proto::rwapi::Worker>) -> (Vec<(String, String)>, usize) {
    let Some(worker) = worker else {
        return (Vec::new(), 1);
    };
    let mut properties = Vec::new();
    for device in &worker.devices {
        for (name, value) in &device.properties {
            properties.push((name.clone(), value.clone()));
        }
    }
    (properties, worker.devices.len().max(1))
}

fn pack_digest(digest: &ProtoDigest) -> prost_types::Any {
    prost_types::Any {
        type_url: String::new(),
        value: digest.encode_to_vec(),
    }
}

#[tonic::async_trait]
impl Bots for BotsInstanceService {
    async fn create_bot_session(
        &self,
        request: Request<CreateBotSessionRequest>,
    ) -> Result<Response<BotSession>, Status> {
        let request = request.into_inner();
        let mut session = request
            .bot_session
            .ok_or_else(|| Status::invalid_argument("missing bot_session"))?;
        session.name = format!("{}/{}", request.parent, uuid::Uuid::new_v4());
        session.leases.clear();
        Ok(Response::new(session))
    }

    async fn update_bot_session(
        &self,
        request: Request<UpdateBotSessionRequest>,
    ) -> Result<Response<BotSession>, Status> {
        let request = request.into_inner();
        let mut session = request
            .bot_session
            .ok_or_else(|| Status::invalid_argument("missing bot_session"))?;
        session.name = request.name;

        let mut reconciled = Vec::with_capacity(session.leases.len());
        for lease in std::mem::take(&mut session.leases) {
            reconciled.push(self.reconcile_lease(lease).await?);
        }
        session.leases = reconciled;

        let (properties, capacity) = worker_properties_and_capacity(&session.worker);
        if session.leases.len() < capacity && session.status == BotStatus::Ok as i32 {
            if let Some((job, lease)) = self
                .scheduler
                .assign_lease(&properties)
                .await
                .map_err(Status::from)?
            {
                let action_digest: ProtoDigest = job.action_digest.into();
                session.leases.push(Lease {
                    id: lease.id,
                    payload: Some(pack_digest(&action_digest)),
                    result: None,
                    status: None,
                    state: lease_state_to_proto(lease.state) as i32,
                    expire_time: None,
                });
            }
        }

        Ok(Response::new(session))
    }
}

impl BotsInstanceService {
    /// Applies one bot-reported Lease transition to its Job, or marks the
    /// lease CANCELLED in the response if the server no longer considers it
    /// valid (spec.md §4.8; the "remove if present" fix for the original's
    /// `unregister_operation_peer` bug, spec.md §9 Open Question a, applies
    /// the same "no-op if already gone" discipline here).
    async fn reconcile_lease(&self, lease: Lease) -> Result<Lease, Status> {
        if self.scheduler.get_job(&lease.id).is_none() {
            return Ok(Lease {
                state: ProtoLeaseState::Cancelled as i32,
                ..lease
            });
        }

        let status = lease.status.clone();
        let result = lease
            .result
            .as_ref()
            .and_then(|any| buildgrid_proto::re::ActionResult::decode(&any.value[..]).ok());
        let state = proto_to_lease_state(lease.state);

        self.scheduler
            .update_lease(&lease.id, state, status, result)
            .await
            .map_err(Status::from)?;

        let current_state = self
            .scheduler
            .get_job(&lease.id)
            .and_then(|job| job.lease())
            .map(|lease| lease.state)
            .unwrap_or(LeaseState::Cancelled);

        Ok(Lease {
            state: lease_state_to_proto(current_state) as i32,
            ..lease
        })
    }
}
