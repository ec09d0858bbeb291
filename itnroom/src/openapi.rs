use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Infinitune Rooms API",
        version = "0.1.0",
        description = "Rooms de lecture synchronisée (le canal temps réel est sur /ws/room)",
    ),
    paths(crate::api::list_rooms, crate::api::delete_room),
    components(schemas(crate::api::RoomResponse)),
    tags(
        (name = "rooms", description = "Sessions de lecture synchronisée")
    )
)]
pub struct ApiDoc;
