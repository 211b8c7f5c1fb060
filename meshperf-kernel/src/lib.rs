//! meshperf: orchestration perftest RDMA sur une flotte d'hôtes.
//!
//! Flux: [`topology`] énumère les paires avec leur port et les scripts par hôte,
//! [`orchestrator`] démarre les listeners puis les initiateurs derrière une
//! barrière de disponibilité, [`collect`] rapatrie les rapports, [`correlate`]
//! les transforme en matrices d'endpoints et [`connectivity`] fusionne un
//! passage aller et un retour en santé par lien. [`workflow`] assemble le tout
//! pour la CLI.

pub mod artifact;
pub mod collect;
pub mod config;
pub mod connectivity;
pub mod correlate;
pub mod models;
pub mod orchestrator;
pub mod perftest;
pub mod readiness;
pub mod remote;
pub mod resolve;
pub mod state;
pub mod topology;
pub mod workflow;
