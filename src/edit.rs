//! Incremental edits for an interactive session.
//!
//! Two scenes are compared by node identity: a node is changed when it is new, or
//! when its type, parameter values or incoming links (upstream id and socket)
//! differ. Everything downstream of a changed node is re-declared as well, since
//! consumers must rebind to the new declaration.

use std::collections::{BTreeMap, BTreeSet};

use log::warn;

use crate::{
    codec::column_major,
    compiler::Compiler,
    error::SessionError,
    graph::{ShadingGraph, ShadingNode, SlotValue},
    scene::Scene,
    wire::{Arg, Block, DeclarationRecord, Emitter, Recorder, Statement},
};

pub const EDIT_ATTRIBUTE: &str = "attribute";
pub const EDIT_LIGHT: &str = "light";
pub const EDIT_INSTANCE: &str = "instance";

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SceneDiff {
    /// Affected node indices (in the new graph) per changed material.
    pub materials: BTreeMap<String, BTreeSet<usize>>,
    /// Affected node indices per changed light.
    pub lights: BTreeMap<String, BTreeSet<usize>>,
    /// Objects and lights whose transform changed.
    pub transforms: Vec<String>,
    /// Objects now bound to a different material.
    pub reassigned: Vec<String>,
}

impl SceneDiff {
    pub fn is_empty(&self) -> bool {
        self.materials.is_empty() && self.lights.is_empty() && self.transforms.is_empty() && self.reassigned.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EditSummary {
    pub blocks: usize,
    pub declarations: usize,
}

/// What a node looks like, with links expressed by node id so graphs can be compared.
#[derive(Debug, PartialEq)]
enum SlotSig<'a> {
    Value(&'a crate::codec::HostValue),
    Link(&'a str, &'a str),
    Unset,
}

fn signature<'a>(graph: &'a ShadingGraph, node: &'a ShadingNode) -> (&'a str, Vec<(&'a str, SlotSig<'a>)>) {
    let slots = node
        .slots
        .iter()
        .map(|s| {
            let sig = match &s.value {
                SlotValue::Value(v) => SlotSig::Value(v),
                SlotValue::Connected { node, socket } => SlotSig::Link(&graph.node(*node).id, socket),
                SlotValue::Unset => SlotSig::Unset,
            };
            (s.name.as_str(), sig)
        })
        .collect();
    (node.type_name.as_str(), slots)
}

/// Nodes of `new` that must be re-declared relative to `old`.
pub fn affected_nodes(old: &ShadingGraph, new: &ShadingGraph) -> BTreeSet<usize> {
    let changed: BTreeSet<usize> = new
        .nodes()
        .iter()
        .enumerate()
        .filter(|(_, n)| match old.find(&n.id) {
            Some(o) => signature(old, old.node(o)) != signature(new, n),
            None => true,
        })
        .map(|(i, _)| i)
        .collect();
    if changed.is_empty() {
        return changed;
    }
    new.downstream_closure(&changed)
}

pub fn diff_scenes(old: &Scene, new: &Scene) -> SceneDiff {
    let mut diff = SceneDiff::default();

    for (name, g) in &new.materials {
        let affected = match old.materials.get(name) {
            Some(o) => affected_nodes(o, g),
            None => continue,
        };
        if !affected.is_empty() {
            diff.materials.insert(name.clone(), affected);
        }
    }

    for (light, g) in new.doc.lights.iter().zip(&new.lights) {
        let Some((old_light, old_graph)) = old.light(&light.name) else {
            warn!("light '{}' was added; new lights need a restart", light.name);
            continue;
        };
        let affected = affected_nodes(old_graph, g);
        if !affected.is_empty() {
            diff.lights.insert(light.name.clone(), affected);
        }
        if old_light.transform != light.transform {
            diff.transforms.push(light.name.clone());
        }
    }
    for light in &old.doc.lights {
        if new.light(&light.name).is_none() {
            warn!("light '{}' was removed; removals need a restart", light.name);
        }
    }

    for obj in &new.doc.objects {
        let Some(old_obj) = old.doc.objects.iter().find(|o| o.name == obj.name) else {
            warn!("object '{}' was added; new objects need a restart", obj.name);
            continue;
        };
        if old_obj.transform != obj.transform {
            diff.transforms.push(obj.name.clone());
        }
        if old_obj.material != obj.material {
            diff.reassigned.push(obj.name.clone());
        }
        if old_obj.mesh != obj.mesh {
            warn!("geometry of '{}' changed; geometry edits need a restart", obj.name);
        }
    }
    for obj in &old.doc.objects {
        if !new.doc.objects.iter().any(|o| o.name == obj.name) {
            warn!("object '{}' was removed; removals need a restart", obj.name);
        }
    }

    if old.doc.camera != new.doc.camera || old.doc.resolution != new.doc.resolution {
        warn!("camera changes are not sent to a running session");
    }
    diff
}

/// Emit `diff` as edit blocks. Shading declarations keep the compiler's dependency order.
///
/// Every block is compiled before anything reaches `emitter`, so a graph that fails to
/// compile leaves the renderer's input untouched.
pub fn emit_edits<E: Emitter + ?Sized>(diff: &SceneDiff, scene: &Scene, emitter: &mut E) -> Result<EditSummary, SessionError> {
    let mut planned = Recorder::new();
    let summary = plan_edits(diff, scene, &mut planned)?;
    for statement in planned.statements {
        emitter.emit(statement).map_err(SessionError::Export)?;
    }
    Ok(summary)
}

fn plan_edits(diff: &SceneDiff, scene: &Scene, plan: &mut Recorder) -> Result<EditSummary, SessionError> {
    let mut summary = EditSummary::default();
    let mut push_block = |kind: &str, scope: &str, body: Vec<Statement>, plan: &mut Recorder| {
        let block = Block::Edit {
            kind: kind.to_string(),
            scope: scope.to_string(),
        };
        summary.declarations += body.iter().filter(|s| matches!(s, Statement::Declare(_))).count();
        summary.blocks += 1;
        plan.statements.push(Statement::Begin(block.clone()));
        plan.statements.extend(body);
        plan.statements.push(Statement::End(block));
    };
    let declarations =
        |records: Vec<DeclarationRecord>| -> Vec<Statement> { records.into_iter().map(Statement::Declare).collect() };

    for obj in &scene.doc.objects {
        let Some(material) = obj.material.as_ref() else {
            continue;
        };
        let Some(graph) = scene.materials.get(material) else {
            continue;
        };
        let compiler = if diff.reassigned.contains(&obj.name) {
            Compiler::new(graph)
        } else if let Some(affected) = diff.materials.get(material) {
            Compiler::new(graph).only(affected.clone())
        } else {
            continue;
        };
        let records = compiler.compile_all()?;
        if !records.is_empty() {
            push_block(EDIT_ATTRIBUTE, &obj.name, declarations(records), plan);
        }
    }

    for (name, affected) in &diff.lights {
        let Some((_, graph)) = scene.light(name) else {
            continue;
        };
        let records = Compiler::new(graph)
            .with_light_handle(name.as_str())
            .only(affected.clone())
            .compile_all()?;
        if !records.is_empty() {
            push_block(EDIT_LIGHT, name, declarations(records), plan);
        }
    }

    for name in &diff.transforms {
        let transform = scene
            .doc
            .objects
            .iter()
            .find(|o| &o.name == name)
            .map(|o| o.transform)
            .or_else(|| scene.light(name).map(|(l, _)| l.transform));
        let Some(transform) = transform else {
            continue;
        };
        let body = vec![Statement::Call {
            verb: "Transform".to_string(),
            args: vec![Arg::Floats(column_major(&transform))],
            params: Vec::new(),
        }];
        push_block(EDIT_INSTANCE, name, body, plan);
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dsl::{SceneDsl, parse_scene_str},
        error::CompileError,
        registry::load_default_registry,
        wire::Verb,
    };

    const BASE: &str = r#"{
        "name": "edits",
        "materials": {"wood": {
            "nodes": [
                {"id": "out", "type": "Output"},
                {"id": "bx", "type": "PxrDisney"},
                {"id": "mix", "type": "PxrMix", "params": {"mix": 0.5}},
                {"id": "tex", "type": "PxrTexture", "params": {"filename": "grain.png"}},
                {"id": "other", "type": "PxrMix"}
            ],
            "connections": [
                {"from": {"nodeId": "bx", "portId": "Bxdf"}, "to": {"nodeId": "out", "portId": "Bxdf"}},
                {"from": {"nodeId": "mix", "portId": "resultRGB"}, "to": {"nodeId": "bx", "portId": "baseColor"}},
                {"from": {"nodeId": "tex", "portId": "resultRGB"}, "to": {"nodeId": "mix", "portId": "color1"}},
                {"from": {"nodeId": "other", "portId": "resultRGB"}, "to": {"nodeId": "bx", "portId": "emitColor"}}
            ]
        }},
        "lights": [{"name": "key", "graph": {
            "nodes": [{"id": "out", "type": "Output"}, {"id": "l", "type": "PxrStdAreaLight", "params": {"intensity": 1.0}}],
            "connections": [{"from": {"nodeId": "l", "portId": "Light"}, "to": {"nodeId": "out", "portId": "Light"}}]
        }}],
        "objects": [
            {"name": "table", "material": "wood", "mesh": {"points": [[0,0,0],[1,0,0],[0,1,0]], "faces": [[0,1,2]]}},
            {"name": "floor", "mesh": {"points": [[0,0,0],[1,0,0],[0,1,0]], "faces": [[0,1,2]]}}
        ]
    }"#;

    fn scene(doc: SceneDsl) -> Scene {
        Scene::resolve(doc, &load_default_registry().unwrap(), ".").unwrap()
    }

    fn base() -> SceneDsl {
        parse_scene_str(BASE).unwrap()
    }

    fn handles(rec: &Recorder) -> Vec<String> {
        rec.declarations().filter_map(|r| r.handle.clone()).collect()
    }

    #[test]
    fn unchanged_scene_emits_nothing() {
        let diff = diff_scenes(&scene(base()), &scene(base()));
        assert!(diff.is_empty());
        let mut rec = Recorder::new();
        let summary = emit_edits(&diff, &scene(base()), &mut rec).unwrap();
        assert_eq!(summary, EditSummary::default());
        assert!(rec.statements.is_empty());
    }

    #[test]
    fn changed_pattern_redeclares_it_and_its_consumers_only() {
        let mut doc = base();
        let wood = doc.materials.get_mut("wood").unwrap();
        wood.nodes[2].params.insert("mix".into(), serde_json::json!(0.9));
        let new = scene(doc);

        let diff = diff_scenes(&scene(base()), &new);
        let mut rec = Recorder::new();
        let summary = emit_edits(&diff, &new, &mut rec).unwrap();
        assert_eq!(summary.blocks, 1);
        // tex and other are untouched; out is never declared.
        assert_eq!(handles(&rec), ["wood_mix", "wood_bx"]);
        assert_eq!(
            rec.statements.first(),
            Some(&Statement::Begin(Block::Edit {
                kind: EDIT_ATTRIBUTE.into(),
                scope: "table".into()
            }))
        );
    }

    #[test]
    fn light_and_transform_edits_use_their_own_blocks() {
        let mut doc = base();
        doc.lights[0].graph.nodes[1].params.insert("intensity".into(), serde_json::json!(3.0));
        doc.objects[1].transform[0][3] = 2.0;
        let new = scene(doc);

        let diff = diff_scenes(&scene(base()), &new);
        assert_eq!(diff.transforms, ["floor"]);
        let mut rec = Recorder::new();
        let summary = emit_edits(&diff, &new, &mut rec).unwrap();
        assert_eq!(summary.blocks, 2);

        let kinds: Vec<&str> = rec
            .statements
            .iter()
            .filter_map(|s| match s {
                Statement::Begin(Block::Edit { kind, .. }) => Some(kind.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, [EDIT_LIGHT, EDIT_INSTANCE]);
        let verbs: Vec<Verb> = rec.declarations().map(|r| r.verb).collect();
        assert_eq!(verbs, [Verb::Attribute, Verb::AreaLightSource]);
    }

    #[test]
    fn rewired_output_declares_only_the_new_node() {
        let mut doc = base();
        let wood = doc.materials.get_mut("wood").unwrap();
        wood.nodes.push(crate::dsl::Node {
            id: "bx2".into(),
            node_type: "PxrDiffuse".into(),
            params: Default::default(),
        });
        wood.connections[0].from.node_id = "bx2".into();
        let new = scene(doc);

        let diff = diff_scenes(&scene(base()), &new);
        let mut rec = Recorder::new();
        emit_edits(&diff, &new, &mut rec).unwrap();
        assert_eq!(handles(&rec), ["wood_bx2"]);
    }

    #[test]
    fn reassigned_material_sends_full_graph() {
        let mut doc = base();
        doc.objects[1].material = Some("wood".into());
        let new = scene(doc);

        let diff = diff_scenes(&scene(base()), &new);
        assert_eq!(diff.reassigned, ["floor"]);
        let mut rec = Recorder::new();
        emit_edits(&diff, &new, &mut rec).unwrap();
        assert_eq!(handles(&rec), ["wood_tex", "wood_mix", "wood_other", "wood_bx"]);
    }

    #[test]
    fn failing_graph_writes_no_edit_blocks() {
        let bad = r#"{
            "nodes": [
                {"id": "out", "type": "Output"},
                {"id": "bx", "type": "PxrDiffuse"},
                {"id": "a", "type": "PxrMix"},
                {"id": "b", "type": "PxrMix"}
            ],
            "connections": [
                {"from": {"nodeId": "bx", "portId": "Bxdf"}, "to": {"nodeId": "out", "portId": "Bxdf"}},
                {"from": {"nodeId": "a", "portId": "resultRGB"}, "to": {"nodeId": "bx", "portId": "diffuseColor"}},
                {"from": {"nodeId": "b", "portId": "resultRGB"}, "to": {"nodeId": "a", "portId": "color1"}}
            ]
        }"#;
        let mut old_doc = base();
        old_doc.materials.insert("bad".into(), serde_json::from_str(bad).unwrap());
        old_doc.objects[1].material = Some("bad".into());

        let mut new_doc = old_doc.clone();
        new_doc.materials.get_mut("wood").unwrap().nodes[2]
            .params
            .insert("mix".into(), serde_json::json!(0.9));
        // b now also reads from a: a <-> b.
        let mut back = new_doc.materials["bad"].connections[2].clone();
        back.from.node_id = "a".into();
        back.to.node_id = "b".into();
        new_doc.materials.get_mut("bad").unwrap().connections.push(back);

        let new = scene(new_doc);
        let diff = diff_scenes(&scene(old_doc), &new);
        assert!(diff.materials.contains_key("wood") && diff.materials.contains_key("bad"));

        let mut rec = Recorder::new();
        let err = emit_edits(&diff, &new, &mut rec).unwrap_err();
        assert!(matches!(err, SessionError::Compile(CompileError::CycleDetected { .. })), "{err}");
        assert!(rec.statements.is_empty());
    }
}
