//! Plain data types shared by the local replica, the authority and the wire.

mod change;
mod mutation;
mod node;

pub use change::{Change, ChangeBatch, ChangePayload, ConsumerKey, ConsumerType};
pub use mutation::{
    CreateNodePayload, DeleteNodePayload, InteractionPayload, Mutation, MutationPayload,
    MutationResult, MutationStatus, MutationType, ReactionPayload, RejectReason,
    UpdateDocumentPayload, UpdateNodePayload,
};
pub use node::{Attributes, Document, Node, NodeInteraction, NodeReaction, NodeType};
