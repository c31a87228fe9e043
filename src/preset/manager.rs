//! Exporting the session's replication setup to a preset and applying one.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::client::{OnlineClient, OnlineClients};
use crate::error::PresetError;
use crate::model::{ClientIdentity, MULTI_USER_STREAM_ID, ObjectPath, StreamDescription};
use crate::mute::MuteStateSynchronizer;
use crate::preset::format::{
    LabelObjectPath, MultiUserSessionPreset, PresetClient, PresetMuteEntry, PresetObject,
};
use crate::preset::remap::{SceneResolver, remap_to_world, to_label_path};
use crate::protocol::{
    ChangeMuteStateFlags, ChangeMuteStateRequest, MuteSetting, ObjectInStreamId, PutStateRequest,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyPresetFlags {
    /// Clear the Multi-User content of session members the preset does not mention
    pub clear_unreferenced_clients: bool,
}

/// Tracks the one preset apply that may be in flight.
#[derive(Debug, Default)]
pub struct PresetManager {
    apply_in_flight: bool,
}

impl PresetManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_applying(&self) -> bool {
        self.apply_in_flight
    }

    /// Marks an apply as started. Fails if another one has not finished yet.
    pub fn begin_apply(&mut self) -> Result<(), PresetError> {
        if self.apply_in_flight {
            warn!("Preset apply requested while another one is in flight");
            return Err(PresetError::InProgress);
        }
        self.apply_in_flight = true;
        Ok(())
    }

    pub fn finish_apply(&mut self) {
        self.apply_in_flight = false;
    }

    /// Snapshots the stream content, frequencies and mute state of every online client that
    /// passes `filter`.
    pub fn export_to_preset(
        &self,
        online: &OnlineClients,
        mute: &MuteStateSynchronizer,
        resolver: &dyn SceneResolver,
        filter: &dyn Fn(&ClientIdentity) -> bool,
    ) -> Result<MultiUserSessionPreset, PresetError> {
        let clients: Vec<PresetClient> = online
            .iter()
            .filter(|client| filter(client.identity()))
            .map(|client| export_client(client, resolver))
            .collect();
        if clients.is_empty() {
            warn!("No client passed the preset export filter");
            return Err(PresetError::NoClients);
        }

        let to_entries = |objects: &BTreeMap<ObjectPath, MuteSetting>| -> Vec<PresetMuteEntry> {
            objects
                .iter()
                .filter_map(|(object, setting)| {
                    to_label_path(resolver, object).map(|path| PresetMuteEntry {
                        path,
                        setting: *setting,
                    })
                })
                .collect()
        };
        let preset = MultiUserSessionPreset {
            clients,
            muted_objects: to_entries(mute.explicitly_muted()),
            unmuted_objects: to_entries(mute.explicitly_unmuted()),
        };
        info!(clients = preset.clients.len(), "Exported session preset");
        Ok(preset)
    }

    /// Builds the single put-state request that replaces the session content with `preset`.
    ///
    /// Every online client found in the preset gets its Multi-User stream and authority
    /// replaced. The session's mute state is cleared and replaced by the preset's.
    pub fn build_apply_request(
        &self,
        preset: &MultiUserSessionPreset,
        online: &OnlineClients,
        resolver: &dyn SceneResolver,
        flags: ApplyPresetFlags,
    ) -> Result<PutStateRequest, PresetError> {
        let mut request = PutStateRequest::default();
        let mut mapped_objects = 0;

        for client in online.iter() {
            let endpoint_id = client.endpoint_id();
            let (mut streams, mut authority) = custom_stream_state(client);
            match preset.get_client_content(client.identity()) {
                Some(content) => {
                    let (stream, owned) = remap_client(content, resolver);
                    mapped_objects += stream.replication_map.len();
                    authority.extend(owned);
                    streams.push(stream);
                }
                None if flags.clear_unreferenced_clients => {
                    debug!(client = %client.identity(), "Clearing client not in preset");
                }
                None => continue,
            }
            request.new_streams.insert(endpoint_id, streams);
            request.new_authority_state.insert(endpoint_id, authority);
        }

        if mapped_objects == 0 {
            warn!("None of the preset's objects exist in the current world");
            return Err(PresetError::NoObjectsFound);
        }

        request.mute_change = ChangeMuteStateRequest {
            objects_to_mute: remap_mute_entries(&preset.muted_objects, resolver),
            objects_to_unmute: remap_mute_entries(&preset.unmuted_objects, resolver),
            flags: ChangeMuteStateFlags {
                clear_mute_state: true,
            },
        };
        Ok(request)
    }
}

fn export_client(client: &OnlineClient, resolver: &dyn SceneResolver) -> PresetClient {
    let frequency = client
        .stream()
        .multi_user_stream()
        .map(|stream| stream.frequency_settings.clone())
        .unwrap_or_default();
    let objects = client
        .confirmed_map()
        .objects
        .iter()
        .filter_map(|(object, info)| {
            let Some(path) = to_label_path(resolver, object) else {
                debug!(%object, "Skipping object without actor label");
                return None;
            };
            Some(PresetObject {
                path,
                class_path: info.class_path.clone(),
                properties: info.property_selection.clone(),
                has_authority: client.authority().has_authority_over(object),
                frequency_override: frequency.overrides.get(object).copied(),
            })
        })
        .collect();
    PresetClient {
        identity: client.identity().clone(),
        objects,
        default_frequency: frequency.defaults,
    }
}

/// Streams and authority of a client outside the Multi-User stream, which a preset leaves alone.
fn custom_stream_state(client: &OnlineClient) -> (Vec<StreamDescription>, BTreeSet<ObjectInStreamId>) {
    let streams = client
        .stream()
        .streams()
        .iter()
        .filter(|stream| !stream.is_multi_user())
        .cloned()
        .collect();
    let authority = client
        .authority()
        .authority()
        .iter()
        .flat_map(|(object, streams)| {
            streams
                .iter()
                .filter(|stream_id| **stream_id != MULTI_USER_STREAM_ID)
                .map(move |stream_id| ObjectInStreamId::new(*stream_id, object.clone()))
        })
        .collect();
    (streams, authority)
}

fn remap_client(
    content: &PresetClient,
    resolver: &dyn SceneResolver,
) -> (StreamDescription, BTreeSet<ObjectInStreamId>) {
    let mut stream = StreamDescription::multi_user();
    stream.frequency_settings = content.base_frequency_settings();
    let mut owned = BTreeSet::new();
    for object in &content.objects {
        let Some(path) = remap_to_world(resolver, &object.path) else {
            debug!(object = %object.path, "Preset object not found in current world");
            continue;
        };
        if object.properties.is_empty() {
            continue;
        }
        stream
            .replication_map
            .add_properties(&path, &object.class_path, &object.properties);
        if let Some(frequency) = object.frequency_override {
            stream
                .frequency_settings
                .overrides
                .insert(path.clone(), frequency);
        }
        if object.has_authority {
            owned.insert(ObjectInStreamId::new(MULTI_USER_STREAM_ID, path));
        }
    }
    (stream, owned)
}

fn remap_mute_entries(
    entries: &[PresetMuteEntry],
    resolver: &dyn SceneResolver,
) -> BTreeMap<ObjectPath, MuteSetting> {
    entries
        .iter()
        .filter_map(|entry| remap_to_world(resolver, &entry.path).map(|path| (path, entry.setting)))
        .collect()
}

/// Label paths of every object in a preset, for previews.
pub fn preset_objects(preset: &MultiUserSessionPreset) -> BTreeSet<&LabelObjectPath> {
    preset
        .clients
        .iter()
        .flat_map(|client| client.objects.iter().map(|object| &object.path))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::OnlineClientKind;
    use crate::model::{EndpointId, PropertyChain, StreamId, StreamIdSet};
    use crate::preset::remap::StaticScene;
    use crate::protocol::ClientStateSnapshot;

    fn scene() -> StaticScene {
        StaticScene::new()
            .with_actor("Cube", ObjectPath::new("World:StaticMeshActor_1"))
            .with_actor("Floor", ObjectPath::new("World:StaticMeshActor_2"))
    }

    fn client(id: u128, name: &str, objects: &[&str]) -> OnlineClient {
        let kind = if id == 1 {
            OnlineClientKind::Local
        } else {
            OnlineClientKind::Remote
        };
        let mut client = OnlineClient::new(EndpointId::from_u128(id), ClientIdentity::new(name, "Laptop"), kind);
        let mut multi_user = StreamDescription::multi_user();
        let mut custom = StreamDescription::new(StreamId(uuid::Uuid::from_u128(7)));
        let mut authority = BTreeMap::new();
        for object in objects {
            let path = ObjectPath::new(*object);
            multi_user
                .replication_map
                .add_properties(&path, "StaticMeshActor", [&PropertyChain::from_path("Scale")]);
            custom
                .replication_map
                .add_properties(&path, "StaticMeshActor", [&PropertyChain::from_path("Tag")]);
            authority.insert(path, StreamIdSet::from([MULTI_USER_STREAM_ID, custom.stream_id]));
        }
        client.apply_snapshot(&ClientStateSnapshot {
            streams: vec![multi_user, custom],
            authority,
            sync_control: BTreeSet::new(),
        });
        client
    }

    fn session() -> OnlineClients {
        let mut clients = OnlineClients::new(client(1, "Alice", &["World:StaticMeshActor_1"]));
        clients.insert_remote(client(2, "Bob", &["World:StaticMeshActor_2"]));
        clients
    }

    #[test]
    fn test_export_skips_filtered_clients() {
        let manager = PresetManager::new();
        let mut mute = MuteStateSynchronizer::new();
        mute.apply_request(&ChangeMuteStateRequest {
            objects_to_mute: BTreeMap::from([(
                ObjectPath::new("World:StaticMeshActor_2"),
                MuteSetting::default(),
            )]),
            ..ChangeMuteStateRequest::default()
        });

        let preset = manager
            .export_to_preset(&session(), &mute, &scene(), &|identity| identity.display_name != "Bob")
            .unwrap();
        assert_eq!(preset.clients.len(), 1);
        assert_eq!(preset.clients[0].objects[0].path, LabelObjectPath::actor("Cube"));
        assert!(preset.clients[0].objects[0].has_authority);
        assert_eq!(preset.muted_objects[0].path, LabelObjectPath::actor("Floor"));

        let none = manager.export_to_preset(&session(), &mute, &scene(), &|_| false);
        assert_eq!(none, Err(PresetError::NoClients));
    }

    #[test]
    fn test_apply_request_keeps_custom_streams() {
        let manager = PresetManager::new();
        let clients = session();
        let preset = manager
            .export_to_preset(&clients, &MuteStateSynchronizer::new(), &scene(), &|_| true)
            .unwrap();

        let request = manager
            .build_apply_request(&preset, &clients, &scene(), ApplyPresetFlags::default())
            .unwrap();
        let alice = EndpointId::from_u128(1);
        assert_eq!(request.new_streams[&alice].len(), 2);
        assert!(request.new_authority_state[&alice].contains(&ObjectInStreamId::new(
            MULTI_USER_STREAM_ID,
            ObjectPath::new("World:StaticMeshActor_1")
        )));
        assert_eq!(request.new_authority_state[&alice].len(), 2);
        assert!(request.mute_change.flags.clear_mute_state);
    }

    #[test]
    fn test_unreferenced_clients_are_cleared_only_on_request() {
        let manager = PresetManager::new();
        let clients = session();
        let mut preset = manager
            .export_to_preset(&clients, &MuteStateSynchronizer::new(), &scene(), &|_| true)
            .unwrap();
        preset.clients.retain(|client| client.identity.display_name == "Alice");
        let bob = EndpointId::from_u128(2);

        let untouched = manager
            .build_apply_request(&preset, &clients, &scene(), ApplyPresetFlags::default())
            .unwrap();
        assert!(!untouched.new_streams.contains_key(&bob));

        let cleared = manager
            .build_apply_request(
                &preset,
                &clients,
                &scene(),
                ApplyPresetFlags {
                    clear_unreferenced_clients: true,
                },
            )
            .unwrap();
        assert!(cleared.new_streams[&bob].iter().all(|stream| !stream.is_multi_user()));
    }

    #[test]
    fn test_apply_into_unrelated_world_finds_nothing() {
        let manager = PresetManager::new();
        let clients = session();
        let preset = manager
            .export_to_preset(&clients, &MuteStateSynchronizer::new(), &scene(), &|_| true)
            .unwrap();
        let other_world = StaticScene::new().with_actor("Sphere", ObjectPath::new("Other:Sphere"));
        assert_eq!(
            manager.build_apply_request(&preset, &clients, &other_world, ApplyPresetFlags::default()),
            Err(PresetError::NoObjectsFound)
        );
    }

    #[test]
    fn test_only_one_apply_in_flight() {
        let mut manager = PresetManager::new();
        assert!(manager.begin_apply().is_ok());
        assert_eq!(manager.begin_apply(), Err(PresetError::InProgress));
        manager.finish_apply();
        assert!(manager.begin_apply().is_ok());
    }
}
