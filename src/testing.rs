//! In-process fakes for the hardware and guest ports

use crate::domain::ports::{
    AttachConfig, DetachConfig, FcpId, GuestConfigurator, GuestDirectory, HardwareQuery,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;

/// Render a device block in the hypervisor's listing format
pub fn device_block(id: &str, status: &str, npiv: &str, physical: &str, owner: &str) -> String {
    format!(
        "opnstk1: FCP device number: {id}\n\
         opnstk1:   Status: {status}\n\
         opnstk1:   NPIV world wide port number: {npiv}\n\
         opnstk1:   Channel path ID: 27\n\
         opnstk1:   Physical world wide port number: {physical}\n\
         opnstk1:   Owner: {owner}\n"
    )
}

/// Listing of free devices with distinct WWPNs
pub fn free_listing(ids: &[&str]) -> String {
    ids.iter()
        .map(|id| {
            device_block(
                id,
                "Free",
                &format!("C05076DE3300{}", id),
                &format!("C05076DE3301{}", id),
                "NONE",
            )
        })
        .collect()
}

/// Hardware query returning a settable listing
#[derive(Default)]
pub struct FakeHardware {
    listing: Mutex<String>,
}

impl FakeHardware {
    pub fn new(listing: String) -> Self {
        Self {
            listing: Mutex::new(listing),
        }
    }

    pub fn set_listing(&self, listing: String) {
        *self.listing.lock() = listing;
    }
}

#[async_trait]
impl HardwareQuery for FakeHardware {
    async fn query_fcp_devices(&self, _target: &str) -> Result<String> {
        Ok(self.listing.lock().clone())
    }
}

/// Guest directory and configurator that records calls and fails on demand
#[derive(Default)]
pub struct FakeGuest {
    pub guests: Mutex<BTreeSet<String>>,
    pub dedicated: Mutex<BTreeSet<(String, String)>>,
    pub fail_dedicate: Mutex<BTreeSet<String>>,
    pub fail_undedicate: Mutex<BTreeSet<String>>,
    pub fail_configure: Mutex<bool>,
    pub attach_calls: Mutex<Vec<AttachConfig>>,
    pub detach_calls: Mutex<Vec<DetachConfig>>,
}

impl FakeGuest {
    pub fn with_guests(guests: &[&str]) -> Self {
        let fake = Self::default();
        fake.guests
            .lock()
            .extend(guests.iter().map(|g| g.to_string()));
        fake
    }

    pub fn is_dedicated(&self, fcp_id: &str, userid: &str) -> bool {
        self.dedicated
            .lock()
            .contains(&(fcp_id.to_string(), userid.to_string()))
    }
}

#[async_trait]
impl GuestDirectory for FakeGuest {
    async fn guest_exists(&self, userid: &str) -> Result<bool> {
        Ok(self.guests.lock().contains(userid))
    }

    async fn dedicate(&self, fcp_id: &FcpId, userid: &str) -> Result<()> {
        if self.fail_dedicate.lock().contains(fcp_id.as_str()) {
            return Err(Error::operation("dedicate", format!("cannot dedicate {}", fcp_id)));
        }
        self.dedicated
            .lock()
            .insert((fcp_id.to_string(), userid.to_string()));
        Ok(())
    }

    async fn undedicate(&self, fcp_id: &FcpId, userid: &str) -> Result<()> {
        if self.fail_undedicate.lock().contains(fcp_id.as_str()) {
            return Err(Error::operation("undedicate", format!("cannot undedicate {}", fcp_id)));
        }
        self.dedicated
            .lock()
            .remove(&(fcp_id.to_string(), userid.to_string()));
        Ok(())
    }
}

#[async_trait]
impl GuestConfigurator for FakeGuest {
    async fn configure_attach(&self, request: &AttachConfig) -> Result<()> {
        if *self.fail_configure.lock() {
            return Err(Error::operation("configure_attach", "guest configuration failed"));
        }
        self.attach_calls.lock().push(request.clone());
        Ok(())
    }

    async fn configure_detach(&self, request: &DetachConfig) -> Result<()> {
        if *self.fail_configure.lock() {
            return Err(Error::operation("configure_detach", "guest configuration failed"));
        }
        self.detach_calls.lock().push(request.clone());
        Ok(())
    }
}
