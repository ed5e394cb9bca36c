//! Bookkeeping of outstanding requests.
use std::{collections::HashMap, time::Duration};

use ldap3::SearchEntry;
use tokio::{sync::mpsc, time};
use tracing::debug;

use super::{RequestId, ViewEvent};
use crate::{contact::Contact, diff::AttributeOp, transport::MessageId};

/// Interval between polls while requests are outstanding
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Where a modification is at
#[derive(Debug)]
pub(crate) enum ModifyPhase {
	/// Reading the current entry
	Lookup {
		/// The entry, once it arrived
		existing: Option<SearchEntry>,
	},
	/// Renaming the entry, then writing `ops` to `new_dn`
	Rename {
		/// Attribute changes still to write
		ops: Vec<AttributeOp>,
		/// DN after the rename
		new_dn: String,
	},
	/// Writing the attribute changes
	Write,
}

/// What a logical request is and how far it got
#[derive(Debug)]
pub(crate) enum Request {
	/// Adding a contact; the contact carries its new DN
	Create {
		/// The contact being created
		contact: Contact,
	},
	/// Deleting an entry
	Remove {
		/// DN of the entry
		id: String,
	},
	/// Updating a contact
	Modify {
		/// The desired contact
		contact: Contact,
		/// Progress
		phase: ModifyPhase,
	},
	/// Reading a single contact
	Get {
		/// DN of the entry
		id: String,
		/// The contact, once it arrived
		found: Option<Contact>,
	},
	/// A search feeding a view
	Search {
		/// Where entries go
		view: mpsc::UnboundedSender<ViewEvent>,
	},
}

/// A logical request waiting for the server
#[derive(Debug)]
pub(crate) struct PendingOperation {
	/// The id the caller knows the request by
	pub request: RequestId,
	/// Request state
	pub kind: Request,
}

/// Drives polling while requests are outstanding
#[derive(Debug, Default)]
pub(crate) struct PollTimer {
	/// The ticking interval, if running
	interval: Option<time::Interval>,
}

impl PollTimer {
	/// Whether the timer is running
	pub fn is_running(&self) -> bool {
		self.interval.is_some()
	}

	/// Start ticking, unless already running
	fn start(&mut self) {
		if self.interval.is_none() {
			debug!("Starting poll timer");
			let mut interval = time::interval(POLL_INTERVAL);
			interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
			self.interval = Some(interval);
		}
	}

	/// Stop ticking
	fn stop(&mut self) {
		if self.interval.take().is_some() {
			debug!("Stopping poll timer");
		}
	}

	/// Wait for the next tick. Returns immediately when stopped.
	pub async fn tick(&mut self) {
		if let Some(interval) = &mut self.interval {
			interval.tick().await;
		}
	}
}

/// Outstanding requests keyed by message id.
///
/// An operation being dispatched is checked out of the map but still counted
/// as active, until it is checked back in under some id or finished.
#[derive(Debug, Default)]
pub(crate) struct OperationTable {
	/// Operations by the id of their outstanding message
	ops: HashMap<MessageId, PendingOperation>,
	/// Number of logical requests not yet finished
	active: usize,
	/// Runs while `active` is nonzero
	timer: PollTimer,
}

impl OperationTable {
	/// Register a new operation. Hands the operation back if the id is taken.
	pub fn insert(
		&mut self,
		id: MessageId,
		op: PendingOperation,
	) -> Result<(), PendingOperation> {
		if self.ops.contains_key(&id) {
			return Err(op);
		}
		self.ops.insert(id, op);
		self.active += 1;
		self.sync_timer();
		Ok(())
	}

	/// Take an operation out for dispatch
	pub fn checkout(&mut self, id: MessageId) -> Option<PendingOperation> {
		self.ops.remove(&id)
	}

	/// Put a checked out operation back, possibly under a new id. Hands the
	/// operation back if the id is taken; it still has to be finished.
	pub fn checkin(
		&mut self,
		id: MessageId,
		op: PendingOperation,
	) -> Result<(), PendingOperation> {
		if self.ops.contains_key(&id) {
			return Err(op);
		}
		self.ops.insert(id, op);
		Ok(())
	}

	/// Account for a checked out operation that completed
	pub fn finish(&mut self) {
		self.active = self.active.saturating_sub(1);
		self.sync_timer();
	}

	/// Remove an operation for good
	pub fn remove(&mut self, id: MessageId) -> Option<PendingOperation> {
		let op = self.checkout(id)?;
		self.finish();
		Some(op)
	}

	/// Remove every operation in the map
	pub fn drain(&mut self) -> Vec<(MessageId, PendingOperation)> {
		let drained: Vec<_> = self.ops.drain().collect();
		self.active = self.active.saturating_sub(drained.len());
		self.sync_timer();
		drained
	}

	/// The message id a request is waiting on
	pub fn find(&self, request: RequestId) -> Option<MessageId> {
		self.ops.iter().find(|(_, op)| op.request == request).map(|(id, _)| *id)
	}

	/// Number of operations in the map
	pub fn len(&self) -> usize {
		self.ops.len()
	}

	/// Number of unfinished requests
	#[cfg(test)]
	pub fn active(&self) -> usize {
		self.active
	}

	/// The poll timer
	pub fn timer(&mut self) -> &mut PollTimer {
		&mut self.timer
	}

	/// Whether polling is running
	pub fn is_polling(&self) -> bool {
		self.timer.is_running()
	}

	/// Run the timer iff something is outstanding
	fn sync_timer(&mut self) {
		if self.active > 0 {
			self.timer.start();
		} else {
			self.timer.stop();
		}
	}
}
